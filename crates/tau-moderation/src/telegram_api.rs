//! Telegram Bot API adapter backing the profile inspector and chat actuator.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tau_moderation_types::{ChatId, MessageId, UserId, ViolationSet};
use tracing::debug;

use crate::collaborators::{ChatActuator, ChatApiError, ProfileInspector};

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

const ADMIN_STATUSES: [&str; 2] = ["creator", "administrator"];

/// Connection settings for the Bot API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramApiConfig {
    pub api_base: String,
    pub bot_token: String,
    pub http_timeout_ms: u64,
}

impl TelegramApiConfig {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
        }
    }
}

/// Identity reported by `getMe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub user_id: UserId,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramBotApi {
    config: TelegramApiConfig,
    client: Client,
}

impl TelegramBotApi {
    pub fn new(config: TelegramApiConfig) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            bail!("telegram bot token cannot be empty");
        }
        if config.api_base.trim().trim_end_matches('/').is_empty() {
            bail!("telegram api base cannot be empty");
        }
        // Long polls hold the connection open for the poll timeout, so the
        // client timeout is applied per request instead.
        let client = Client::builder()
            .build()
            .context("failed to create telegram http client")?;
        Ok(Self { config, client })
    }

    pub async fn get_me(&self) -> Result<BotIdentity, ChatApiError> {
        let result = self.call("getMe", json!({}), None).await?;
        let user_id = result
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| invalid_response("getMe", "missing result.id"))?;
        Ok(BotIdentity {
            user_id,
            username: non_empty_str(result.get("username")),
        })
    }

    /// Removes a registered webhook so `getUpdates` is accepted.
    pub async fn delete_webhook(&self) -> Result<(), ChatApiError> {
        self.call(
            "deleteWebhook",
            json!({"drop_pending_updates": false}),
            None,
        )
        .await?;
        Ok(())
    }

    /// Long-polls for updates starting at `offset`; returns the raw update objects.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_seconds: u64,
    ) -> Result<Vec<Value>, ChatApiError> {
        let body = json!({
            "offset": offset,
            "timeout": timeout_seconds,
            "allowed_updates": ["message", "chat_member"],
        });
        let timeout = Duration::from_secs(timeout_seconds)
            + Duration::from_millis(self.config.http_timeout_ms);
        let result = self.call("getUpdates", body, Some(timeout)).await?;
        match result {
            Value::Array(updates) => Ok(updates),
            _ => Err(invalid_response("getUpdates", "result is not an array")),
        }
    }

    async fn get_chat_member(&self, user_id: UserId, chat_id: ChatId) -> Result<Value, ChatApiError> {
        self.call(
            "getChatMember",
            json!({"chat_id": chat_id, "user_id": user_id}),
            None,
        )
        .await
    }

    async fn profile_photo_count(&self, user_id: UserId) -> Result<u64, ChatApiError> {
        let result = self
            .call(
                "getUserProfilePhotos",
                json!({"user_id": user_id, "limit": 1}),
                None,
            )
            .await?;
        result
            .get("total_count")
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid_response("getUserProfilePhotos", "missing result.total_count"))
    }

    async fn chat_photo_present(&self, user_id: UserId) -> Result<bool, ChatApiError> {
        let result = self.call("getChat", json!({"chat_id": user_id}), None).await?;
        Ok(result.get("photo").is_some_and(|photo| !photo.is_null()))
    }

    async fn call(
        &self,
        method: &'static str,
        body: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, ChatApiError> {
        let base = self.config.api_base.trim().trim_end_matches('/');
        let url = format!("{base}/bot{}/{method}", self.config.bot_token.trim());
        let timeout =
            timeout.unwrap_or_else(|| Duration::from_millis(self.config.http_timeout_ms.max(1)));

        let response = self
            .client
            .post(url.as_str())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|error| ChatApiError::Transport {
                method,
                detail: error.without_url().to_string(),
            })?;
        let status = response.status();
        let raw = response.text().await.map_err(|error| ChatApiError::Transport {
            method,
            detail: error.without_url().to_string(),
        })?;
        let payload = serde_json::from_str::<Value>(&raw).unwrap_or(Value::Null);

        if !status.is_success() {
            let (reason_code, retryable) = classify_provider_status(status);
            return Err(ChatApiError::Provider {
                method,
                status: status.as_u16(),
                reason_code,
                retryable,
                description: payload
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("no description")
                    .to_string(),
            });
        }
        if payload.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(invalid_response(method, "response is not ok"));
        }
        debug!(method, status = status.as_u16(), "telegram call succeeded");
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| invalid_response(method, "missing result"))
    }
}

#[async_trait]
impl ProfileInspector for TelegramBotApi {
    async fn evaluate(
        &self,
        user_id: UserId,
        chat_id: ChatId,
    ) -> Result<ViolationSet, ChatApiError> {
        let member = self.get_chat_member(user_id, chat_id).await?;
        if is_admin_member(&member) {
            return Ok(ViolationSet::none());
        }
        let no_handle = non_empty_str(member.pointer("/user/username")).is_none();

        let photo_count = self.profile_photo_count(user_id).await?;
        let (no_photo, private_photo) = if photo_count > 0 {
            (false, false)
        } else if self.chat_photo_present(user_id).await? {
            // Photo exists but is hidden from the bot by privacy settings.
            (false, true)
        } else {
            (true, false)
        };

        Ok(ViolationSet {
            no_photo,
            private_photo,
            no_handle,
        })
    }

    async fn is_admin(&self, user_id: UserId, chat_id: ChatId) -> Result<bool, ChatApiError> {
        let member = self.get_chat_member(user_id, chat_id).await?;
        Ok(is_admin_member(&member))
    }
}

#[async_trait]
impl ChatActuator for TelegramBotApi {
    async fn ban(&self, user_id: UserId, chat_id: ChatId) -> Result<(), ChatApiError> {
        self.call(
            "banChatMember",
            json!({"chat_id": chat_id, "user_id": user_id}),
            None,
        )
        .await?;
        Ok(())
    }

    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<MessageId, ChatApiError> {
        let result = self
            .call(
                "sendMessage",
                json!({"chat_id": chat_id, "text": text, "parse_mode": "HTML"}),
                None,
            )
            .await?;
        result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| invalid_response("sendMessage", "missing result.message_id"))
    }

    async fn delete_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
    ) -> Result<(), ChatApiError> {
        self.call(
            "deleteMessage",
            json!({"chat_id": chat_id, "message_id": message_id}),
            None,
        )
        .await?;
        Ok(())
    }
}

fn classify_provider_status(status: StatusCode) -> (&'static str, bool) {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ("rate_limited", true);
    }
    if status.is_server_error() {
        return ("provider_unavailable", true);
    }
    if status.is_client_error() {
        return ("request_rejected", false);
    }
    ("unknown_http_failure", true)
}

fn is_admin_member(member: &Value) -> bool {
    member
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|status| ADMIN_STATUSES.contains(&status))
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn invalid_response(method: &'static str, detail: &str) -> ChatApiError {
    ChatApiError::InvalidResponse {
        method,
        detail: detail.to_string(),
    }
}
