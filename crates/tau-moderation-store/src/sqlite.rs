//! SQLite-backed `WarningStore` and `EventLog` with durable persistence.

use crate::{
    EventLog, ModerationEvent, ModerationEventKind, ModerationStoreError, StoreResult, UserId,
    ViolationSet, WarningRecord, WarningStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const WARNING_COLUMNS: &str = "user_id, warning_id, chat_id, challenge_message_id, display_name, violations_json, created_at, expires_at";

/// Persistent SQLite backend holding the `warnings` and `logs` tables.
#[derive(Debug, Clone)]
pub struct SqliteModerationStore {
    db_path: Arc<PathBuf>,
}

impl SqliteModerationStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            db_path: Arc::new(db_path),
        };
        let connection = open_connection(&store.db_path)?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Reads audit rows back in append order, optionally for one user.
    ///
    /// Operator tooling only; the scheduler never reads the log.
    pub async fn query_events(&self, user_id: Option<UserId>) -> StoreResult<Vec<ModerationEvent>> {
        self.with_connection(move |connection| {
            let mut statement = connection.prepare(
                r#"
                SELECT user_id, chat_id, kind, detail, timestamp
                FROM logs
                WHERE (?1 IS NULL OR user_id = ?1)
                ORDER BY id
                "#,
            )?;
            let rows = statement
                .query_map(params![user_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(user_id, chat_id, kind, detail, timestamp)| {
                    Ok(ModerationEvent {
                        user_id,
                        chat_id,
                        kind: event_kind_from_db(&kind)?,
                        detail,
                        timestamp: timestamp_from_db(&timestamp)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn with_connection<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db_path = self.db_path.clone();
        let join = tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&db_path)?;
            operation(&mut connection)
        });
        join.await.map_err(|error| {
            ModerationStoreError::Worker(format!("failed to join sqlite task: {error}"))
        })?
    }
}

fn open_connection(db_path: &Path) -> StoreResult<Connection> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS warnings (
            user_id INTEGER PRIMARY KEY,
            warning_id TEXT NOT NULL,
            chat_id INTEGER NOT NULL,
            challenge_message_id INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            violations_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            chat_id INTEGER NOT NULL,
            kind TEXT NOT NULL,
            detail TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_logs_user ON logs (user_id, id);
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl WarningStore for SqliteModerationStore {
    async fn put(&self, record: WarningRecord) -> StoreResult<Option<WarningRecord>> {
        self.with_connection(move |connection| {
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let replaced = select_warning(&transaction, record.user_id)?;
            transaction.execute(
                r#"
                INSERT OR REPLACE INTO warnings (
                    user_id, warning_id, chat_id, challenge_message_id, display_name,
                    violations_json, created_at, expires_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    record.user_id,
                    record.warning_id,
                    record.chat_id,
                    record.challenge_message_id,
                    record.display_name,
                    serde_json::to_string(&record.violations)?,
                    timestamp_to_db(record.created_at),
                    timestamp_to_db(record.expires_at),
                ],
            )?;
            transaction.commit()?;
            Ok(replaced)
        })
        .await
    }

    async fn take_if_present(&self, user_id: UserId) -> StoreResult<Option<WarningRecord>> {
        self.with_connection(move |connection| take_warning(connection, user_id, None))
            .await
    }

    async fn take_if_matches(
        &self,
        user_id: UserId,
        warning_id: &str,
    ) -> StoreResult<Option<WarningRecord>> {
        let warning_id = warning_id.to_string();
        self.with_connection(move |connection| {
            take_warning(connection, user_id, Some(warning_id.as_str()))
        })
        .await
    }

    async fn exists(&self, user_id: UserId) -> StoreResult<bool> {
        self.with_connection(move |connection| {
            let found = connection
                .query_row(
                    "SELECT 1 FROM warnings WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<WarningRecord>> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {WARNING_COLUMNS} FROM warnings ORDER BY user_id"
            ))?;
            let rows = statement
                .query_map([], read_warning_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(WarningRow::into_record).collect()
        })
        .await
    }
}

#[async_trait]
impl EventLog for SqliteModerationStore {
    async fn append(&self, event: ModerationEvent) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO logs (user_id, chat_id, kind, detail, timestamp)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    event.user_id,
                    event.chat_id,
                    event.kind.as_str(),
                    event.detail,
                    timestamp_to_db(event.timestamp),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn select_warning(connection: &Connection, user_id: UserId) -> StoreResult<Option<WarningRecord>> {
    connection
        .query_row(
            &format!("SELECT {WARNING_COLUMNS} FROM warnings WHERE user_id = ?1"),
            params![user_id],
            read_warning_row,
        )
        .optional()?
        .map(WarningRow::into_record)
        .transpose()
}

/// Select and delete in one `IMMEDIATE` transaction so concurrent takers
/// serialize on the row. With `warning_id` set, a newer row is left alone.
fn take_warning(
    connection: &mut Connection,
    user_id: UserId,
    warning_id: Option<&str>,
) -> StoreResult<Option<WarningRecord>> {
    let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let record = select_warning(&transaction, user_id)?
        .filter(|record| warning_id.is_none_or(|expected| record.warning_id == expected));
    let Some(record) = record else {
        transaction.commit()?;
        return Ok(None);
    };

    transaction.execute(
        "DELETE FROM warnings WHERE user_id = ?1 AND warning_id = ?2",
        params![user_id, record.warning_id],
    )?;
    transaction.commit()?;
    Ok(Some(record))
}

struct WarningRow {
    user_id: i64,
    warning_id: String,
    chat_id: i64,
    challenge_message_id: i64,
    display_name: String,
    violations_json: String,
    created_at: String,
    expires_at: String,
}

impl WarningRow {
    fn into_record(self) -> StoreResult<WarningRecord> {
        Ok(WarningRecord {
            warning_id: self.warning_id,
            user_id: self.user_id,
            chat_id: self.chat_id,
            challenge_message_id: self.challenge_message_id,
            display_name: self.display_name,
            violations: serde_json::from_str::<ViolationSet>(&self.violations_json)?,
            created_at: timestamp_from_db(&self.created_at)?,
            expires_at: timestamp_from_db(&self.expires_at)?,
        })
    }
}

fn read_warning_row(row: &Row<'_>) -> rusqlite::Result<WarningRow> {
    Ok(WarningRow {
        user_id: row.get(0)?,
        warning_id: row.get(1)?,
        chat_id: row.get(2)?,
        challenge_message_id: row.get(3)?,
        display_name: row.get(4)?,
        violations_json: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn event_kind_from_db(value: &str) -> StoreResult<ModerationEventKind> {
    ModerationEventKind::parse(value).ok_or_else(|| ModerationStoreError::InvalidPersistedValue {
        field: "kind",
        value: value.to_string(),
    })
}
