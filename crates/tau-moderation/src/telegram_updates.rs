//! `getUpdates` decoding and the long-poll ingress loop.

use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::gateway::{ChatUser, InboundEvent, InboundMessage, MemberJoined, ModerationGateway};
use crate::telegram_api::TelegramBotApi;

pub const DEFAULT_POLL_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

const LEFT_STATUSES: [&str; 2] = ["left", "kicked"];
const JOINED_STATUSES: [&str; 2] = ["member", "restricted"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub poll_timeout_seconds: u64,
    pub error_backoff: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_timeout_seconds: DEFAULT_POLL_TIMEOUT_SECONDS,
            error_backoff: DEFAULT_POLL_ERROR_BACKOFF,
        }
    }
}

/// Counters reported when the polling loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollingSummary {
    pub polls: u64,
    pub poll_failures: u64,
    pub updates: u64,
    pub handled_events: u64,
    pub handler_failures: u64,
    pub next_offset: i64,
}

/// Decodes one raw update; returns `None` for updates the bot does not moderate.
pub fn decode_update(update: &Value) -> Option<InboundEvent> {
    if let Some(message) = update.get("message") {
        return decode_message(message).map(InboundEvent::Message);
    }
    if let Some(member_update) = update.get("chat_member") {
        return decode_member_joined(member_update).map(InboundEvent::MemberJoined);
    }
    None
}

fn decode_message(message: &Value) -> Option<InboundMessage> {
    // Service messages about membership are covered by chat_member updates.
    if message.get("new_chat_members").is_some() || message.get("left_chat_member").is_some() {
        return None;
    }
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(InboundMessage {
        chat_id: message.pointer("/chat/id").and_then(Value::as_i64)?,
        message_id: message.get("message_id").and_then(Value::as_i64)?,
        from: decode_user(message.get("from")?)?,
        text,
    })
}

fn decode_member_joined(member_update: &Value) -> Option<MemberJoined> {
    let old_status = member_update
        .pointer("/old_chat_member/status")
        .and_then(Value::as_str)?;
    let new_status = member_update
        .pointer("/new_chat_member/status")
        .and_then(Value::as_str)?;
    if !LEFT_STATUSES.contains(&old_status) || !JOINED_STATUSES.contains(&new_status) {
        return None;
    }
    Some(MemberJoined {
        chat_id: member_update.pointer("/chat/id").and_then(Value::as_i64)?,
        user: decode_user(member_update.pointer("/new_chat_member/user")?)?,
    })
}

fn decode_user(user: &Value) -> Option<ChatUser> {
    Some(ChatUser {
        user_id: user.get("id").and_then(Value::as_i64)?,
        username: user
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string),
        is_bot: user.get("is_bot").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Long-polls the Bot API and feeds every decoded event to `gateway` until
/// `shutdown` flips to true.
pub async fn run_telegram_polling(
    api: &TelegramBotApi,
    gateway: &ModerationGateway,
    config: PollingConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<PollingSummary> {
    let mut summary = PollingSummary::default();
    info!(
        poll_timeout_seconds = config.poll_timeout_seconds,
        "telegram polling started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let polled = tokio::select! {
            polled = api.get_updates(summary.next_offset, config.poll_timeout_seconds) => polled,
            _ = shutdown.changed() => break,
        };
        summary.polls = summary.polls.saturating_add(1);

        let updates = match polled {
            Ok(updates) => updates,
            Err(error) => {
                summary.poll_failures = summary.poll_failures.saturating_add(1);
                warn!(%error, retryable = error.is_retryable(), "telegram getUpdates failed");
                tokio::select! {
                    _ = tokio::time::sleep(config.error_backoff) => {}
                    _ = shutdown.changed() => break,
                }
                continue;
            }
        };

        for update in &updates {
            summary.updates = summary.updates.saturating_add(1);
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                summary.next_offset = summary.next_offset.max(update_id.saturating_add(1));
            }
            let Some(event) = decode_update(update) else {
                debug!("skipping unsupported telegram update");
                continue;
            };
            match gateway.handle(event).await {
                Ok(outcome) => {
                    summary.handled_events = summary.handled_events.saturating_add(1);
                    debug!(?outcome, "telegram update handled");
                }
                Err(error) => {
                    summary.handler_failures = summary.handler_failures.saturating_add(1);
                    warn!(error = %format!("{error:#}"), "failed to handle telegram update");
                }
            }
        }
    }

    info!(
        polls = summary.polls,
        updates = summary.updates,
        handled_events = summary.handled_events,
        "telegram polling stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;
    use tau_moderation_store::{InMemoryEventLog, InMemoryWarningStore};
    use tokio::sync::watch;

    use super::{decode_update, run_telegram_polling, PollingConfig};
    use crate::gateway::{GatewayConfig, InboundEvent, ModerationGateway};
    use crate::scheduler::{ModerationConfig, ModerationScheduler};
    use crate::telegram_api::{TelegramApiConfig, TelegramBotApi};

    #[test]
    fn decodes_group_text_message() {
        let update = json!({
            "update_id": 10,
            "message": {
                "message_id": 42,
                "chat": {"id": -1001, "type": "supergroup"},
                "from": {"id": 7, "is_bot": false, "first_name": "Ana", "username": "ana"},
                "text": "hola"
            }
        });
        let Some(InboundEvent::Message(message)) = decode_update(&update) else {
            panic!("expected message");
        };
        assert_eq!(message.chat_id, -1001);
        assert_eq!(message.message_id, 42);
        assert_eq!(message.from.username.as_deref(), Some("ana"));
        assert_eq!(message.text.as_deref(), Some("hola"));
    }

    #[test]
    fn decodes_join_transition_only() {
        let joined = json!({
            "update_id": 11,
            "chat_member": {
                "chat": {"id": -1001},
                "old_chat_member": {"status": "left", "user": {"id": 7}},
                "new_chat_member": {"status": "member", "user": {"id": 7, "first_name": "Ana"}}
            }
        });
        let promoted = json!({
            "update_id": 12,
            "chat_member": {
                "chat": {"id": -1001},
                "old_chat_member": {"status": "member", "user": {"id": 7}},
                "new_chat_member": {"status": "administrator", "user": {"id": 7}}
            }
        });

        let Some(InboundEvent::MemberJoined(event)) = decode_update(&joined) else {
            panic!("expected join");
        };
        assert_eq!(event.user.user_id, 7);
        assert!(event.user.username.is_none());
        assert!(decode_update(&promoted).is_none());
    }

    #[test]
    fn skips_membership_service_messages() {
        let update = json!({
            "update_id": 13,
            "message": {
                "message_id": 43,
                "chat": {"id": -1001},
                "from": {"id": 7, "first_name": "Ana"},
                "new_chat_members": [{"id": 7, "first_name": "Ana"}]
            }
        });
        assert!(decode_update(&update).is_none());
        assert!(decode_update(&json!({"update_id": 14, "edited_message": {}})).is_none());
    }

    #[tokio::test]
    async fn polling_advances_offset_and_stops_on_shutdown() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/bottok/getUpdates")
                .json_body_includes(r#"{"offset": 0}"#);
            then.status(200).json_body(json!({
                "ok": true,
                "result": [
                    {"update_id": 5, "edited_message": {}},
                    {"update_id": 6, "message": {
                        "message_id": 1,
                        "chat": {"id": 999},
                        "from": {"id": 7, "first_name": "Ana"},
                        "text": "hola"
                    }}
                ]
            }));
        });
        server.mock(|when, then| {
            when.method(POST)
                .path("/bottok/getUpdates")
                .json_body_includes(r#"{"offset": 7}"#);
            then.status(200)
                .delay(Duration::from_millis(200))
                .json_body(json!({"ok": true, "result": []}));
        });

        let api = Arc::new(
            TelegramBotApi::new(TelegramApiConfig {
                api_base: server.base_url(),
                bot_token: "tok".to_string(),
                http_timeout_ms: 2_000,
            })
            .expect("api"),
        );
        let scheduler = ModerationScheduler::new(
            ModerationConfig::default(),
            Arc::new(InMemoryWarningStore::new()),
            Arc::new(InMemoryEventLog::new()),
            api.clone(),
            api.clone(),
        );
        let gateway = ModerationGateway::new(
            GatewayConfig { group_id: -1001 },
            scheduler,
            api.clone(),
            api.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = shutdown_tx.send(true);
        });
        let summary = run_telegram_polling(
            &api,
            &gateway,
            PollingConfig {
                poll_timeout_seconds: 0,
                error_backoff: Duration::from_millis(10),
            },
            shutdown_rx,
        )
        .await
        .expect("polling");
        stopper.await.expect("stopper");

        assert_eq!(summary.next_offset, 7);
        assert_eq!(summary.updates, 2);
        // Message from another chat is decoded and ignored by the gateway.
        assert_eq!(summary.handled_events, 1);
        first.assert_calls(1);
    }
}
