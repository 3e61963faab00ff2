use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::json;
use tau_moderation::{
    ChatActuator, GatewayConfig, ModerationConfig, ModerationGateway, ModerationScheduler,
    PollingConfig, ProfileInspector, TelegramApiConfig, TelegramBotApi,
};
use tau_moderation_store::{SqliteModerationStore, WarningStore};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cli_args::{Cli, CliCommand};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    match &cli.command {
        CliCommand::Run => run_moderation(&cli).await,
        CliCommand::Warnings => print_warnings(&cli).await,
        CliCommand::Events { user_id } => print_events(&cli, *user_id).await,
        CliCommand::Inspect { user_id } => inspect_profile(&cli, *user_id).await,
    }
}

fn require_group_id(cli: &Cli) -> Result<i64> {
    cli.group_id
        .ok_or_else(|| anyhow!("--group-id (or TAU_MODERATION_GROUP_ID) is required"))
}

fn open_store(cli: &Cli) -> Result<SqliteModerationStore> {
    SqliteModerationStore::new(&cli.db_path).with_context(|| {
        format!(
            "failed to open moderation store {}",
            cli.db_path.display()
        )
    })
}

fn build_api(cli: &Cli) -> Result<TelegramBotApi> {
    let token = cli
        .bot_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| anyhow!("--bot-token (or TAU_MODERATION_BOT_TOKEN) is required"))?;
    TelegramBotApi::new(TelegramApiConfig {
        api_base: cli.api_base.clone(),
        bot_token: token.to_string(),
        http_timeout_ms: cli.http_timeout_ms,
    })
}

async fn run_moderation(cli: &Cli) -> Result<()> {
    let group_id = require_group_id(cli)?;
    let api = Arc::new(build_api(cli)?);
    let store = Arc::new(open_store(cli)?);

    let config = ModerationConfig {
        grace_period: Duration::from_secs(cli.grace_seconds),
        ..ModerationConfig::default()
    };
    config.validate()?;

    let identity = api.get_me().await.context("telegram getMe failed")?;
    info!(
        bot_user_id = identity.user_id,
        bot_username = identity.username.as_deref().unwrap_or("unknown"),
        group_id,
        "bot initialized"
    );
    if let Err(error) = api.delete_webhook().await {
        warn!(%error, "failed to delete existing webhook");
    }

    let inspector: Arc<dyn ProfileInspector> = api.clone();
    let actuator: Arc<dyn ChatActuator> = api.clone();
    let scheduler = ModerationScheduler::new(
        config,
        store.clone(),
        store.clone(),
        inspector.clone(),
        actuator.clone(),
    );
    let recovered = scheduler
        .recover()
        .await
        .context("failed to recover outstanding warnings")?;
    info!(recovered, db_path = %store.path().display(), "moderation store ready");

    match actuator
        .send_message(group_id, &scheduler.config().messages.welcome)
        .await
    {
        Ok(_) => info!(group_id, "welcome message sent"),
        Err(error) => warn!(group_id, %error, "failed to send welcome message"),
    }

    let gateway = ModerationGateway::new(
        GatewayConfig { group_id },
        scheduler.clone(),
        inspector,
        actuator,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received; stopping"),
            Err(error) => warn!(%error, "failed to listen for interrupt"),
        }
        let _ = shutdown_tx.send(true);
    });

    let summary = tau_moderation::run_telegram_polling(
        &api,
        &gateway,
        PollingConfig {
            poll_timeout_seconds: cli.poll_timeout_seconds,
            ..PollingConfig::default()
        },
        shutdown_rx,
    )
    .await?;
    info!(
        polls = summary.polls,
        handled_events = summary.handled_events,
        handler_failures = summary.handler_failures,
        pending_timers = scheduler.live_timer_count(),
        "moderation stopped; pending warnings resume on next start"
    );
    Ok(())
}

async fn print_warnings(cli: &Cli) -> Result<()> {
    let store = open_store(cli)?;
    let warnings = store.list().await.context("failed to list warnings")?;
    println!("{}", serde_json::to_string_pretty(&warnings)?);
    Ok(())
}

async fn print_events(cli: &Cli, user_id: Option<i64>) -> Result<()> {
    let store = open_store(cli)?;
    let events = store
        .query_events(user_id)
        .await
        .context("failed to query moderation events")?;
    println!("{}", serde_json::to_string_pretty(&events)?);
    Ok(())
}

async fn inspect_profile(cli: &Cli, user_id: i64) -> Result<()> {
    let group_id = require_group_id(cli)?;
    let api = build_api(cli)?;
    let is_admin = api
        .is_admin(user_id, group_id)
        .await
        .context("failed to resolve member status")?;
    let violations = api
        .evaluate(user_id, group_id)
        .await
        .context("failed to evaluate profile")?;
    let payload = json!({
        "user_id": user_id,
        "chat_id": group_id,
        "is_admin": is_admin,
        "violations": violations,
        "has_violation": violations.has_violation(),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
