//! Profile-compliance moderation: warning scheduler, event gateway and the
//! Telegram Bot API adapter.

pub mod collaborators;
pub mod gateway;
pub mod notice;
pub mod scheduler;
pub mod telegram_api;
pub mod telegram_updates;

pub use collaborators::{ChatActuator, ChatApiError, ProfileInspector};
pub use gateway::{
    ChatUser, GatewayConfig, GatewayOutcome, InboundEvent, InboundMessage, MemberJoined,
    ModerationGateway,
};
pub use notice::{describe_violations, violation_phrase, ModerationMessages};
pub use scheduler::{
    ExpiryOutcome, ModerationConfig, ModerationError, ModerationScheduler, OpenedWarning,
    WarningRequest, DEFAULT_EVENT_LOG_TIMEOUT, DEFAULT_GRACE_PERIOD, DEFAULT_STORE_RETRY_BACKOFF,
};
pub use telegram_api::{
    BotIdentity, TelegramApiConfig, TelegramBotApi, DEFAULT_HTTP_TIMEOUT_MS,
    DEFAULT_TELEGRAM_API_BASE,
};
pub use telegram_updates::{
    decode_update, run_telegram_polling, PollingConfig, PollingSummary,
    DEFAULT_POLL_ERROR_BACKOFF, DEFAULT_POLL_TIMEOUT_SECONDS,
};
