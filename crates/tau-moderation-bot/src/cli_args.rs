use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tau_moderation::{DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_POLL_TIMEOUT_SECONDS, DEFAULT_TELEGRAM_API_BASE};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "tau-moderation",
    about = "Profile-compliance moderation bot for a single Telegram group",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "bot-token",
        env = "TAU_MODERATION_BOT_TOKEN",
        hide_env_values = true,
        help = "Telegram bot token used for Bot API calls"
    )]
    pub(crate) bot_token: Option<String>,

    #[arg(
        long = "group-id",
        env = "TAU_MODERATION_GROUP_ID",
        allow_negative_numbers = true,
        help = "Chat id of the moderated group (supergroup ids are negative)"
    )]
    pub(crate) group_id: Option<i64>,

    #[arg(
        long = "db-path",
        env = "TAU_MODERATION_DB_PATH",
        default_value = ".tau/moderation/moderation.sqlite",
        help = "SQLite database holding outstanding warnings and the audit log"
    )]
    pub(crate) db_path: PathBuf,

    #[arg(
        long = "grace-seconds",
        env = "TAU_MODERATION_GRACE_SECONDS",
        default_value_t = 300,
        value_parser = parse_positive_u64,
        help = "Seconds a warned user has to fix their profile before removal"
    )]
    pub(crate) grace_seconds: u64,

    #[arg(
        long = "api-base",
        env = "TAU_MODERATION_API_BASE",
        default_value = DEFAULT_TELEGRAM_API_BASE,
        help = "Base URL for the Telegram Bot API"
    )]
    pub(crate) api_base: String,

    #[arg(
        long = "http-timeout-ms",
        env = "TAU_MODERATION_HTTP_TIMEOUT_MS",
        default_value_t = DEFAULT_HTTP_TIMEOUT_MS,
        value_parser = parse_positive_u64,
        help = "Timeout applied to each Bot API request"
    )]
    pub(crate) http_timeout_ms: u64,

    #[arg(
        long = "poll-timeout-seconds",
        env = "TAU_MODERATION_POLL_TIMEOUT_SECONDS",
        default_value_t = DEFAULT_POLL_TIMEOUT_SECONDS,
        help = "Long-poll timeout passed to getUpdates"
    )]
    pub(crate) poll_timeout_seconds: u64,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Poll the group and moderate until interrupted.
    Run,
    /// Print outstanding warnings as JSON.
    Warnings,
    /// Print audit log rows as JSON.
    Events {
        #[arg(
            long = "user-id",
            allow_negative_numbers = true,
            help = "Only print events for this user"
        )]
        user_id: Option<i64>,
    },
    /// Evaluate one member's profile and print the violation set as JSON.
    Inspect {
        #[arg(long = "user-id", help = "Member to evaluate")]
        user_id: i64,
    },
}
