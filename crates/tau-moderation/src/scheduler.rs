//! Per-user warning countdowns with at-most-once sanction.
//!
//! Each warning arms one tokio task that sleeps for the grace period. Cancel
//! claims a record with `WarningStore::take_if_present` and expiry with
//! `WarningStore::take_if_matches`, so exactly one of them wins and a stale
//! timer can never consume a newer warning. The handle table keyed by user id
//! decides which timer may reach the store; it is never locked across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tau_moderation_store::{EventLog, ModerationStoreError, WarningStore};
use tau_moderation_types::{
    ChatId, MessageId, ModerationEvent, ModerationEventKind, ModerationState, UserId,
    ViolationSet, WarningRecord,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::collaborators::{ChatActuator, ProfileInspector};
use crate::notice::ModerationMessages;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);
pub const DEFAULT_EVENT_LOG_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STORE_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Errors surfaced to callers of `open`, `cancel` and `recover`.
#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("invalid moderation request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] ModerationStoreError),
}

/// Scheduler timing and notice configuration.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    pub grace_period: Duration,
    /// Upper bound on a single audit append before it is abandoned.
    pub event_log_timeout: Duration,
    /// Delay before an expiry that could not reach the store is retried.
    pub store_retry_backoff: Duration,
    pub messages: ModerationMessages,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            event_log_timeout: DEFAULT_EVENT_LOG_TIMEOUT,
            store_retry_backoff: DEFAULT_STORE_RETRY_BACKOFF,
            messages: ModerationMessages::default(),
        }
    }
}

impl ModerationConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.grace_period.is_zero() {
            anyhow::bail!("grace_period must be greater than 0");
        }
        if self.event_log_timeout.is_zero() {
            anyhow::bail!("event_log_timeout must be greater than 0");
        }
        if self.store_retry_backoff.is_zero() {
            anyhow::bail!("store_retry_backoff must be greater than 0");
        }
        Ok(())
    }
}

/// Parameters for issuing a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarningRequest {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub display_name: String,
    pub violations: ViolationSet,
    pub challenge_message_id: MessageId,
}

/// Result of [`ModerationScheduler::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedWarning {
    pub record: WarningRecord,
    /// Earlier warning for the same user that this one replaced.
    pub superseded: Option<WarningRecord>,
}

/// What a timer fire did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Another path already claimed, cancelled or superseded the warning.
    NotFound,
    Resolved,
    Sanctioned,
    KickFailed,
    RecheckFailed,
    /// The claim failed; the warning stays outstanding and expiry is retried.
    StoreFailed,
}

impl ExpiryOutcome {
    /// Lifecycle state reached by the user, if the warning was consumed.
    pub fn terminal_state(self) -> Option<ModerationState> {
        match self {
            Self::Resolved | Self::RecheckFailed => Some(ModerationState::Resolved),
            Self::Sanctioned | Self::KickFailed => Some(ModerationState::Sanctioned),
            Self::NotFound | Self::StoreFailed => None,
        }
    }
}

struct TimerHandle {
    warning_id: String,
    stop: watch::Sender<bool>,
}

struct SchedulerInner {
    config: ModerationConfig,
    warnings: Arc<dyn WarningStore>,
    events: Arc<dyn EventLog>,
    inspector: Arc<dyn ProfileInspector>,
    actuator: Arc<dyn ChatActuator>,
    timers: Mutex<HashMap<UserId, TimerHandle>>,
    next_sequence: AtomicU64,
}

/// Owns per-user grace-period timers and executes sanctions at expiry.
#[derive(Clone)]
pub struct ModerationScheduler {
    inner: Arc<SchedulerInner>,
}

impl ModerationScheduler {
    pub fn new(
        config: ModerationConfig,
        warnings: Arc<dyn WarningStore>,
        events: Arc<dyn EventLog>,
        inspector: Arc<dyn ProfileInspector>,
        actuator: Arc<dyn ChatActuator>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                warnings,
                events,
                inspector,
                actuator,
                timers: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ModerationConfig {
        &self.inner.config
    }

    /// Persists a warning and arms its countdown, superseding any running one.
    ///
    /// Returns once the record is stored; the countdown runs in the background.
    /// A store failure is returned before any timer is armed.
    pub async fn open(&self, request: WarningRequest) -> Result<OpenedWarning, ModerationError> {
        if !request.violations.has_violation() {
            return Err(ModerationError::InvalidRequest(format!(
                "user {} has no violation to warn about",
                request.user_id
            )));
        }

        let record = WarningRecord::new(
            self.next_warning_id(request.user_id),
            request.user_id,
            request.chat_id,
            request.challenge_message_id,
            request.display_name,
            request.violations,
            self.inner.config.grace_period,
        );
        let superseded = self.inner.warnings.put(record.clone()).await?;
        // The handle swap must follow the put with no await in between.
        self.arm_timer(
            record.user_id,
            record.warning_id.clone(),
            self.inner.config.grace_period,
        );

        self.record_event(ModerationEvent::new(
            record.user_id,
            record.chat_id,
            ModerationEventKind::WarningIssued,
            format!(
                "violations={} challenge_message_id={}",
                record.violations, record.challenge_message_id
            ),
        ))
        .await;

        let superseded_warning_id = superseded
            .as_ref()
            .map(|previous| previous.warning_id.as_str());
        info!(
            user_id = record.user_id,
            chat_id = record.chat_id,
            warning_id = %record.warning_id,
            violations = %record.violations,
            superseded_warning_id,
            "warning issued"
        );
        Ok(OpenedWarning { record, superseded })
    }

    /// Withdraws the outstanding warning for `user_id`.
    ///
    /// Returns `Ok(false)` when there was nothing to cancel.
    pub async fn cancel(&self, user_id: UserId) -> Result<bool, ModerationError> {
        let Some(record) = self.inner.warnings.take_if_present(user_id).await? else {
            debug!(user_id, "no outstanding warning to cancel");
            return Ok(false);
        };

        self.retire_timer(user_id, &record.warning_id);
        self.record_event(ModerationEvent::new(
            record.user_id,
            record.chat_id,
            ModerationEventKind::WarningCancelled,
            format!("violations={}", record.violations),
        ))
        .await;
        info!(
            user_id,
            chat_id = record.chat_id,
            warning_id = %record.warning_id,
            "warning cancelled"
        );
        Ok(true)
    }

    /// Re-arms timers for warnings persisted before a restart.
    ///
    /// Deadlines already in the past fire immediately.
    pub async fn recover(&self) -> Result<usize, ModerationError> {
        let records = self.inner.warnings.list().await?;
        let now = Utc::now();
        for record in &records {
            let remaining = record.remaining(now);
            debug!(
                user_id = record.user_id,
                warning_id = %record.warning_id,
                remaining_ms = u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
                "re-arming persisted warning"
            );
            self.arm_timer(record.user_id, record.warning_id.clone(), remaining);
        }
        if !records.is_empty() {
            info!(count = records.len(), "recovered outstanding warnings");
        }
        Ok(records.len())
    }

    /// Observability only; reports `Warned` while a record is outstanding.
    pub async fn state(&self, user_id: UserId) -> Result<ModerationState, ModerationError> {
        if self.inner.warnings.exists(user_id).await? {
            return Ok(ModerationState::Warned);
        }
        Ok(ModerationState::Clean)
    }

    pub fn has_live_timer(&self, user_id: UserId) -> bool {
        self.lock_timers().contains_key(&user_id)
    }

    pub fn live_timer_count(&self) -> usize {
        self.lock_timers().len()
    }

    fn next_warning_id(&self, user_id: UserId) -> String {
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        format!("{user_id}-{}-{sequence}", Utc::now().timestamp_millis())
    }

    fn lock_timers(&self) -> MutexGuard<'_, HashMap<UserId, TimerHandle>> {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_timer(&self, user_id: UserId, warning_id: String, delay: Duration) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let previous = self.lock_timers().insert(
            user_id,
            TimerHandle {
                warning_id: warning_id.clone(),
                stop: stop_tx,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
            debug!(
                user_id,
                superseded_warning_id = %previous.warning_id,
                warning_id = %warning_id,
                "superseded running timer"
            );
        }
        self.spawn_timer(user_id, warning_id, delay, stop_rx);
    }

    /// Arms a retry for `warning_id` unless another timer took the slot.
    fn rearm_if_vacant(&self, user_id: UserId, warning_id: String, delay: Duration) -> bool {
        let (stop_tx, stop_rx) = watch::channel(false);
        {
            let mut timers = self.lock_timers();
            if timers.contains_key(&user_id) {
                return false;
            }
            timers.insert(
                user_id,
                TimerHandle {
                    warning_id: warning_id.clone(),
                    stop: stop_tx,
                },
            );
        }
        self.spawn_timer(user_id, warning_id, delay, stop_rx);
        true
    }

    fn spawn_timer(
        &self,
        user_id: UserId,
        warning_id: String,
        delay: Duration,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => {
                    debug!(user_id, warning_id = %warning_id, "timer stopped before expiry");
                    return;
                }
            }

            if !scheduler.retire_timer(user_id, &warning_id) {
                debug!(user_id, warning_id = %warning_id, "timer superseded at fire time");
                return;
            }
            let outcome = scheduler.expire(user_id, &warning_id).await;
            debug!(
                user_id,
                warning_id = %warning_id,
                ?outcome,
                state = ?outcome.terminal_state(),
                "timer fired"
            );
            if outcome == ExpiryOutcome::StoreFailed {
                let backoff = scheduler.inner.config.store_retry_backoff;
                if scheduler.rearm_if_vacant(user_id, warning_id.clone(), backoff) {
                    warn!(
                        user_id,
                        warning_id = %warning_id,
                        retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "expiry deferred; user stays warned until the retry"
                    );
                }
            }
        });
    }

    /// Removes the handle for `user_id` if it still belongs to `warning_id`.
    fn retire_timer(&self, user_id: UserId, warning_id: &str) -> bool {
        let mut timers = self.lock_timers();
        if timers
            .get(&user_id)
            .is_some_and(|handle| handle.warning_id == warning_id)
        {
            if let Some(handle) = timers.remove(&user_id) {
                let _ = handle.stop.send(true);
            }
            return true;
        }
        false
    }

    pub(crate) async fn expire(&self, user_id: UserId, warning_id: &str) -> ExpiryOutcome {
        let record = match self
            .inner
            .warnings
            .take_if_matches(user_id, warning_id)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(user_id, warning_id, "warning already cleared at expiry");
                return ExpiryOutcome::NotFound;
            }
            Err(error) => {
                error!(user_id, warning_id, %error, "failed to claim warning at expiry");
                return ExpiryOutcome::StoreFailed;
            }
        };

        let current = match self
            .inner
            .inspector
            .evaluate(record.user_id, record.chat_id)
            .await
        {
            Ok(current) => current,
            Err(error) => {
                warn!(
                    user_id,
                    chat_id = record.chat_id,
                    %error,
                    "profile re-check failed at expiry; skipping sanction"
                );
                self.record_event(ModerationEvent::new(
                    record.user_id,
                    record.chat_id,
                    ModerationEventKind::RecheckFailed,
                    format!("snapshot={} error={error}", record.violations),
                ))
                .await;
                return ExpiryOutcome::RecheckFailed;
            }
        };

        if !current.has_violation() {
            self.record_event(ModerationEvent::new(
                record.user_id,
                record.chat_id,
                ModerationEventKind::WarningResolved,
                format!("snapshot={}", record.violations),
            ))
            .await;
            info!(
                user_id,
                chat_id = record.chat_id,
                "profile corrected before expiry"
            );
            return ExpiryOutcome::Resolved;
        }

        self.sanction(&record, current).await
    }

    async fn sanction(&self, record: &WarningRecord, current: ViolationSet) -> ExpiryOutcome {
        let actuator = &self.inner.actuator;

        if let Err(error) = actuator.ban(record.user_id, record.chat_id).await {
            error!(
                user_id = record.user_id,
                chat_id = record.chat_id,
                %error,
                "failed to ban user"
            );
            self.delete_challenge(record).await;
            self.record_event(ModerationEvent::new(
                record.user_id,
                record.chat_id,
                ModerationEventKind::KickFailed,
                format!("violations={current} error={error}"),
            ))
            .await;
            return ExpiryOutcome::KickFailed;
        }
        info!(
            user_id = record.user_id,
            chat_id = record.chat_id,
            violations = %current,
            "user banned"
        );

        let notice = self
            .inner
            .config
            .messages
            .render_kick(&record.display_name, &current);
        if let Err(error) = actuator.send_message(record.chat_id, &notice).await {
            warn!(
                user_id = record.user_id,
                chat_id = record.chat_id,
                %error,
                "failed to send kick notice"
            );
        }
        self.delete_challenge(record).await;

        self.record_event(ModerationEvent::new(
            record.user_id,
            record.chat_id,
            ModerationEventKind::UserKicked,
            format!("violations={current}"),
        ))
        .await;
        ExpiryOutcome::Sanctioned
    }

    async fn delete_challenge(&self, record: &WarningRecord) {
        if let Err(error) = self
            .inner
            .actuator
            .delete_message(record.chat_id, record.challenge_message_id)
            .await
        {
            warn!(
                user_id = record.user_id,
                chat_id = record.chat_id,
                message_id = record.challenge_message_id,
                %error,
                "failed to delete warning message"
            );
        }
    }

    async fn record_event(&self, event: ModerationEvent) {
        let kind = event.kind.as_str();
        let user_id = event.user_id;
        match tokio::time::timeout(
            self.inner.config.event_log_timeout,
            self.inner.events.append(event),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                warn!(user_id, kind, %error, "failed to append moderation event");
            }
            Err(_) => {
                warn!(user_id, kind, "moderation event append timed out");
            }
        }
    }
}
