//! Contracts for the chat-platform collaborators the scheduler depends on.

use async_trait::async_trait;
use tau_moderation_types::{ChatId, MessageId, UserId, ViolationSet};
use thiserror::Error;

/// Failure reported by a chat-platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatApiError {
    #[error("{method} transport error: {detail}")]
    Transport { method: &'static str, detail: String },
    #[error("{method} failed with status {status} ({reason_code}): {description}")]
    Provider {
        method: &'static str,
        status: u16,
        reason_code: &'static str,
        retryable: bool,
        description: String,
    },
    #[error("{method} returned an invalid response: {detail}")]
    InvalidResponse { method: &'static str, detail: String },
}

impl ChatApiError {
    /// Returns true when repeating the call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::InvalidResponse { .. } => false,
        }
    }
}

/// Reads profile state from the chat platform.
#[async_trait]
pub trait ProfileInspector: Send + Sync {
    /// Current violations for `user_id` in `chat_id`; administrators yield none.
    async fn evaluate(&self, user_id: UserId, chat_id: ChatId)
        -> Result<ViolationSet, ChatApiError>;

    async fn is_admin(&self, user_id: UserId, chat_id: ChatId) -> Result<bool, ChatApiError>;
}

/// Performs moderation side effects on the chat platform.
#[async_trait]
pub trait ChatActuator: Send + Sync {
    async fn ban(&self, user_id: UserId, chat_id: ChatId) -> Result<(), ChatApiError>;

    /// Sends `text` (HTML) and returns the id of the posted message.
    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<MessageId, ChatApiError>;

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), ChatApiError>;
}
