pub mod config;
pub mod doctor;
pub mod membership;
pub mod migrate;
pub mod tail;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use caucus_core::config::{AppConfig, LoadOptions};
use caucus_db::{connect_from_config, migrations, DbPool};
use caucus_slack::web::BotIdentity;
use caucus_slack::{SlackApi, SlackWebClient};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

/// Upper bound on waiting for blocking reads (stdin) when a command ends.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Process exit codes. Doctor reports its own pass/fail as 0/1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Ok,
    ChecksFailed,
    Config,
    Runtime,
    Database,
    Migration,
    Slack,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::ChecksFailed => 1,
            Self::Config => 2,
            Self::Runtime => 3,
            Self::Database => 4,
            Self::Migration => 5,
            Self::Slack => 6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome<'a> {
    command: &'a str,
    status: &'static str,
    error_class: Option<&'a str>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::render(command, None, message.into(), None, Exit::Ok)
    }

    /// Success envelope carrying a structured `details` payload.
    pub fn success_with(
        command: &str,
        message: impl Into<String>,
        details: impl Serialize,
    ) -> Self {
        let details = serde_json::to_value(details).ok();
        Self::render(command, None, message.into(), details, Exit::Ok)
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit: Exit,
    ) -> Self {
        Self::render(command, Some(error_class), message.into(), None, exit)
    }

    fn render(
        command: &str,
        error_class: Option<&str>,
        message: String,
        details: Option<Value>,
        exit: Exit,
    ) -> Self {
        let payload = CommandOutcome {
            command,
            status: if error_class.is_some() { "error" } else { "ok" },
            error_class,
            message,
            details,
        };
        let output = serde_json::to_string(&payload).unwrap_or_else(|error| {
            format!(
                "{{\"command\":\"{}\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
                escape_json(command),
                escape_json(&error.to_string())
            )
        });
        Self { exit_code: exit.code(), output }
    }
}

pub(crate) fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Why a command body stopped early; becomes the error envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub error_class: &'static str,
    pub message: String,
    pub exit: Exit,
}

impl CommandFailure {
    pub fn new(error_class: &'static str, message: impl Into<String>, exit: Exit) -> Self {
        Self { error_class, message: message.into(), exit }
    }

    pub fn database(error: impl ToString) -> Self {
        Self::new("db_connectivity", error.to_string(), Exit::Database)
    }

    pub fn migration(error: impl ToString) -> Self {
        Self::new("migration", error.to_string(), Exit::Migration)
    }

    pub fn slack(error_class: &'static str, error: impl ToString) -> Self {
        Self::new(error_class, error.to_string(), Exit::Slack)
    }

    pub fn into_result(self, command: &str) -> CommandResult {
        CommandResult::failure(command, self.error_class, self.message, self.exit)
    }
}

pub(crate) fn new_runtime() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

/// Loads config, then drives `body` to completion on a fresh runtime and
/// turns the outcome into the command envelope.
pub(crate) fn execute<T, F, Fut>(
    command: &str,
    body: F,
    on_success: impl FnOnce(T) -> CommandResult,
) -> CommandResult
where
    F: FnOnce(AppConfig) -> Fut,
    Fut: Future<Output = Result<T, CommandFailure>>,
{
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                command,
                "config_validation",
                format!("configuration issue: {error}"),
                Exit::Config,
            );
        }
    };

    let runtime = match new_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                Exit::Runtime,
            );
        }
    };

    let outcome = runtime.block_on(body(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
    match outcome {
        Ok(value) => on_success(value),
        Err(failure) => failure.into_result(command),
    }
}

/// Connects and applies pending migrations.
pub(crate) async fn open_database(config: &AppConfig) -> Result<DbPool, CommandFailure> {
    let pool = connect_from_config(&config.database).await.map_err(CommandFailure::database)?;
    migrations::run_pending(&pool).await.map_err(CommandFailure::migration)?;
    Ok(pool)
}

pub(crate) async fn connect_slack(
    config: &AppConfig,
) -> Result<(Arc<dyn SlackApi>, BotIdentity), CommandFailure> {
    let client =
        SlackWebClient::new(&config.slack).map_err(|error| CommandFailure::slack("slack", error))?;
    let api: Arc<dyn SlackApi> = Arc::new(client);
    let identity =
        api.auth_test().await.map_err(|error| CommandFailure::slack("slack_auth", error))?;
    Ok((api, identity))
}
