//! Shared data types for Tau profile-compliance moderation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chat-platform user identifier.
pub type UserId = i64;
/// Chat-platform chat identifier. Supergroups use negative ids.
pub type ChatId = i64;
/// Chat-platform message identifier, scoped to a chat.
pub type MessageId = i64;

/// A single profile non-compliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    NoPhoto,
    PrivatePhoto,
    NoHandle,
}

impl Violation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoPhoto => "no_photo",
            Self::PrivatePhoto => "private_photo",
            Self::NoHandle => "no_handle",
        }
    }
}

/// Profile violations detected for a user at one point in time.
///
/// Flags are independent. Administrators always evaluate to [`ViolationSet::none`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ViolationSet {
    pub no_photo: bool,
    pub private_photo: bool,
    pub no_handle: bool,
}

impl ViolationSet {
    /// Returns the all-false set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Returns true when at least one flag is set.
    pub fn has_violation(&self) -> bool {
        self.no_photo || self.private_photo || self.no_handle
    }

    /// Returns the set flags in a stable order.
    pub fn violations(&self) -> Vec<Violation> {
        let mut found = Vec::new();
        if self.no_photo {
            found.push(Violation::NoPhoto);
        }
        if self.private_photo {
            found.push(Violation::PrivatePhoto);
        }
        if self.no_handle {
            found.push(Violation::NoHandle);
        }
        found
    }
}

impl fmt::Display for ViolationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let codes = self
            .violations()
            .into_iter()
            .map(Violation::as_str)
            .collect::<Vec<_>>();
        if codes.is_empty() {
            return f.write_str("none");
        }
        f.write_str(&codes.join(","))
    }
}

/// Per-user moderation lifecycle: `Clean -> Warned -> Resolved | Sanctioned`.
///
/// `Resolved` and `Sanctioned` are reported by the expiry that reaches them and
/// collapse back to `Clean` once the warning record is cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModerationState {
    #[default]
    Clean,
    Warned,
    Resolved,
    Sanctioned,
}

/// Outstanding warning for one user. At most one exists per `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRecord {
    /// Identity of this issuance; a re-trigger gets a fresh id.
    pub warning_id: String,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub challenge_message_id: MessageId,
    pub display_name: String,
    pub violations: ViolationSet,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl WarningRecord {
    /// Creates a record issued now that expires after `grace_period`.
    pub fn new(
        warning_id: impl Into<String>,
        user_id: UserId,
        chat_id: ChatId,
        challenge_message_id: MessageId,
        display_name: impl Into<String>,
        violations: ViolationSet,
        grace_period: std::time::Duration,
    ) -> Self {
        let created_at = Utc::now();
        let grace = Duration::from_std(grace_period).unwrap_or_else(|_| Duration::days(36_500));
        Self {
            warning_id: warning_id.into(),
            user_id,
            chat_id,
            challenge_message_id,
            display_name: display_name.into(),
            violations,
            created_at,
            expires_at: created_at
                .checked_add_signed(grace)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Time left until expiry, zero when the deadline has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.expires_at
            .signed_duration_since(now)
            .to_std()
            .unwrap_or_default()
    }
}

/// Kind tag of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationEventKind {
    WarningIssued,
    WarningCancelled,
    WarningResolved,
    UserKicked,
    KickFailed,
    RecheckFailed,
}

impl ModerationEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WarningIssued => "warning_issued",
            Self::WarningCancelled => "warning_cancelled",
            Self::WarningResolved => "warning_resolved",
            Self::UserKicked => "user_kicked",
            Self::KickFailed => "kick_failed",
            Self::RecheckFailed => "recheck_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warning_issued" => Some(Self::WarningIssued),
            "warning_cancelled" => Some(Self::WarningCancelled),
            "warning_resolved" => Some(Self::WarningResolved),
            "user_kicked" => Some(Self::UserKicked),
            "kick_failed" => Some(Self::KickFailed),
            "recheck_failed" => Some(Self::RecheckFailed),
            _ => None,
        }
    }
}

/// Immutable audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationEvent {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub kind: ModerationEventKind,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl ModerationEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        user_id: UserId,
        chat_id: ChatId,
        kind: ModerationEventKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            chat_id,
            kind,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn violation_set_reports_flags_in_stable_order() {
        let set = ViolationSet {
            no_photo: true,
            private_photo: false,
            no_handle: true,
        };
        assert!(set.has_violation());
        assert_eq!(
            set.violations(),
            vec![Violation::NoPhoto, Violation::NoHandle]
        );
        assert_eq!(set.to_string(), "no_photo,no_handle");
        assert!(!ViolationSet::none().has_violation());
        assert_eq!(ViolationSet::none().to_string(), "none");
    }

    #[test]
    fn warning_record_remaining_saturates_at_zero() {
        let record = WarningRecord::new(
            "w-1",
            7,
            -100,
            42,
            "alice",
            ViolationSet {
                no_photo: true,
                ..ViolationSet::none()
            },
            std::time::Duration::from_secs(300),
        );
        assert_eq!(
            record.expires_at - record.created_at,
            Duration::seconds(300)
        );
        let remaining = record.remaining(record.created_at + Duration::seconds(120));
        assert_eq!(remaining, std::time::Duration::from_secs(180));
        assert_eq!(
            record.remaining(record.expires_at + Duration::seconds(5)),
            std::time::Duration::ZERO
        );
    }

    #[test]
    fn event_kind_serializes_as_snake_case() {
        let encoded = serde_json::to_string(&ModerationEventKind::UserKicked).expect("encode");
        assert_eq!(encoded, "\"user_kicked\"");
        assert_eq!(
            ModerationEventKind::parse("warning_resolved"),
            Some(ModerationEventKind::WarningResolved)
        );
        assert_eq!(ModerationEventKind::parse("unknown"), None);
    }
}
