//! Inbound chat events routed into the moderation scheduler.

use std::sync::Arc;

use anyhow::{Context, Result};
use tau_moderation_types::{ChatId, MessageId, UserId, WarningRecord};
use tracing::{debug, info, warn};

use crate::collaborators::{ChatActuator, ProfileInspector};
use crate::scheduler::{ModerationScheduler, WarningRequest};

/// The single community this bot moderates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    pub group_id: ChatId,
}

/// Author of a message or a joining member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub user_id: UserId,
    pub username: Option<String>,
    pub is_bot: bool,
}

impl ChatUser {
    /// Public handle when set, otherwise the numeric id.
    pub fn display_name(&self) -> String {
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|username| !username.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.user_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub from: ChatUser,
    pub text: Option<String>,
}

impl InboundMessage {
    fn is_start_command(&self) -> bool {
        self.text
            .as_deref()
            .and_then(|text| text.split_whitespace().next())
            .and_then(|command| command.split('@').next())
            .is_some_and(|command| command == "/start")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberJoined {
    pub chat_id: ChatId,
    pub user: ChatUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(InboundMessage),
    MemberJoined(MemberJoined),
}

/// What the gateway did with one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    Ignored,
    Replied,
    Exempt,
    Compliant {
        cancelled: bool,
    },
    Warned {
        warning_id: String,
        challenge_message_id: MessageId,
    },
}

#[derive(Clone)]
pub struct ModerationGateway {
    config: GatewayConfig,
    scheduler: ModerationScheduler,
    inspector: Arc<dyn ProfileInspector>,
    actuator: Arc<dyn ChatActuator>,
}

impl ModerationGateway {
    pub fn new(
        config: GatewayConfig,
        scheduler: ModerationScheduler,
        inspector: Arc<dyn ProfileInspector>,
        actuator: Arc<dyn ChatActuator>,
    ) -> Self {
        Self {
            config,
            scheduler,
            inspector,
            actuator,
        }
    }

    pub async fn handle(&self, event: InboundEvent) -> Result<GatewayOutcome> {
        match event {
            InboundEvent::Message(message) => self.handle_message(message).await,
            InboundEvent::MemberJoined(joined) => self.handle_member_joined(joined).await,
        }
    }

    pub async fn handle_message(&self, message: InboundMessage) -> Result<GatewayOutcome> {
        let messages = &self.scheduler.config().messages;
        if message.chat_id != self.config.group_id {
            if message.is_start_command() {
                self.actuator
                    .send_message(message.chat_id, &messages.unauthorized_chat)
                    .await
                    .context("failed to answer /start outside the moderated group")?;
                return Ok(GatewayOutcome::Replied);
            }
            return Ok(GatewayOutcome::Ignored);
        }
        if message.is_start_command() {
            self.actuator
                .send_message(message.chat_id, &messages.welcome)
                .await
                .context("failed to send welcome message")?;
            return Ok(GatewayOutcome::Replied);
        }

        self.moderate(message.chat_id, &message.from, Some(message.message_id))
            .await
    }

    pub async fn handle_member_joined(&self, joined: MemberJoined) -> Result<GatewayOutcome> {
        if joined.chat_id != self.config.group_id {
            return Ok(GatewayOutcome::Ignored);
        }
        self.moderate(joined.chat_id, &joined.user, None).await
    }

    async fn moderate(
        &self,
        chat_id: ChatId,
        user: &ChatUser,
        offending_message_id: Option<MessageId>,
    ) -> Result<GatewayOutcome> {
        if user.is_bot {
            return Ok(GatewayOutcome::Ignored);
        }
        let user_id = user.user_id;
        if self
            .inspector
            .is_admin(user_id, chat_id)
            .await
            .context("failed to resolve member status")?
        {
            debug!(user_id, chat_id, "skipping administrator");
            return Ok(GatewayOutcome::Exempt);
        }

        let violations = self
            .inspector
            .evaluate(user_id, chat_id)
            .await
            .context("failed to evaluate profile")?;
        if !violations.has_violation() {
            let cancelled = self.scheduler.cancel(user_id).await?;
            if cancelled {
                info!(user_id, chat_id, "profile corrected; warning withdrawn");
            }
            return Ok(GatewayOutcome::Compliant { cancelled });
        }

        if let Some(message_id) = offending_message_id {
            match self.actuator.delete_message(chat_id, message_id).await {
                Ok(()) => debug!(user_id, chat_id, message_id, "deleted offending message"),
                Err(error) => warn!(
                    user_id,
                    chat_id,
                    message_id,
                    %error,
                    "failed to delete offending message"
                ),
            }
        }

        let display_name = user.display_name();
        let notice = self.scheduler.config().messages.render_warning(
            &display_name,
            &violations,
            self.scheduler.config().grace_period,
        );
        let challenge_message_id = self
            .actuator
            .send_message(chat_id, &notice)
            .await
            .context("failed to send warning")?;

        let opened = self
            .scheduler
            .open(WarningRequest {
                user_id,
                chat_id,
                display_name,
                violations,
                challenge_message_id,
            })
            .await?;
        if let Some(previous) = &opened.superseded {
            self.delete_stale_challenge(previous).await;
        }
        info!(
            user_id,
            chat_id,
            warning_id = %opened.record.warning_id,
            challenge_message_id,
            on_join = offending_message_id.is_none(),
            "warning sent"
        );
        Ok(GatewayOutcome::Warned {
            warning_id: opened.record.warning_id,
            challenge_message_id,
        })
    }

    /// Best effort; the replaced countdown no longer applies.
    async fn delete_stale_challenge(&self, previous: &WarningRecord) {
        if let Err(error) = self
            .actuator
            .delete_message(previous.chat_id, previous.challenge_message_id)
            .await
        {
            warn!(
                user_id = previous.user_id,
                chat_id = previous.chat_id,
                message_id = previous.challenge_message_id,
                %error,
                "failed to delete superseded warning message"
            );
        }
    }
}
