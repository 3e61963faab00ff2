//! Warning store and audit log abstractions with an in-memory backend.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteModerationStore;
pub use tau_moderation_types::{
    ChatId, MessageId, ModerationEvent, ModerationEventKind, UserId, ViolationSet, WarningRecord,
};

/// Result type for moderation store operations.
pub type StoreResult<T> = Result<T, ModerationStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum ModerationStoreError {
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("store worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Durable user -> outstanding warning mapping.
#[async_trait]
pub trait WarningStore: Send + Sync {
    /// Inserts or replaces the warning for `record.user_id`.
    ///
    /// Returns the record that was replaced, if any.
    async fn put(&self, record: WarningRecord) -> StoreResult<Option<WarningRecord>>;

    /// Atomically reads and removes the warning for `user_id`.
    ///
    /// Concurrent callers racing on the same record observe exactly one `Some`.
    async fn take_if_present(&self, user_id: UserId) -> StoreResult<Option<WarningRecord>>;

    /// Like [`WarningStore::take_if_present`], but only claims the record
    /// issued as `warning_id`. A newer warning for the user is left in place.
    async fn take_if_matches(
        &self,
        user_id: UserId,
        warning_id: &str,
    ) -> StoreResult<Option<WarningRecord>>;

    /// Observability only; decisions go through [`WarningStore::take_if_present`].
    async fn exists(&self, user_id: UserId) -> StoreResult<bool>;

    /// Returns all outstanding warnings ordered by `user_id`.
    async fn list(&self) -> StoreResult<Vec<WarningRecord>>;
}

/// Append-only audit sink.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: ModerationEvent) -> StoreResult<()>;
}

/// In-memory warning store for tests and local experimentation.
#[derive(Debug, Default)]
pub struct InMemoryWarningStore {
    warnings: RwLock<HashMap<UserId, WarningRecord>>,
}

impl InMemoryWarningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WarningStore for InMemoryWarningStore {
    async fn put(&self, record: WarningRecord) -> StoreResult<Option<WarningRecord>> {
        let mut warnings = self.warnings.write().await;
        Ok(warnings.insert(record.user_id, record))
    }

    async fn take_if_present(&self, user_id: UserId) -> StoreResult<Option<WarningRecord>> {
        let mut warnings = self.warnings.write().await;
        Ok(warnings.remove(&user_id))
    }

    async fn take_if_matches(
        &self,
        user_id: UserId,
        warning_id: &str,
    ) -> StoreResult<Option<WarningRecord>> {
        let mut warnings = self.warnings.write().await;
        if warnings
            .get(&user_id)
            .is_some_and(|record| record.warning_id == warning_id)
        {
            return Ok(warnings.remove(&user_id));
        }
        Ok(None)
    }

    async fn exists(&self, user_id: UserId) -> StoreResult<bool> {
        let warnings = self.warnings.read().await;
        Ok(warnings.contains_key(&user_id))
    }

    async fn list(&self) -> StoreResult<Vec<WarningRecord>> {
        let warnings = self.warnings.read().await;
        let mut records = warnings.values().cloned().collect::<Vec<_>>();
        records.sort_by_key(|record| record.user_id);
        Ok(records)
    }
}

/// In-memory audit log that keeps every appended event.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<ModerationEvent>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of appended events in append order.
    pub async fn events(&self) -> Vec<ModerationEvent> {
        self.events.read().await.clone()
    }

    /// Event kinds recorded for `user_id`, in append order.
    pub async fn kinds_for(&self, user_id: UserId) -> Vec<ModerationEventKind> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.user_id == user_id)
            .map(|event| event.kind)
            .collect()
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: ModerationEvent) -> StoreResult<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
