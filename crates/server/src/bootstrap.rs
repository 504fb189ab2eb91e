use std::sync::Arc;

use caucus_core::config::{AppConfig, ConfigError, LoadOptions};
use caucus_db::repositories::{SqlGroupChannelRepository, SqlMessageCacheRepository};
use caucus_db::{connect_from_config, migrations, DbPool};
use caucus_slack::web::BotIdentity;
use caucus_slack::{SlackApi, SlackApiError, SlackWebClient};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::ApiState;
use crate::health::HealthState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub slack: Arc<dyn SlackApi>,
    pub bot_identity: Option<BotIdentity>,
}

impl Application {
    pub fn api_state(&self) -> ApiState {
        ApiState::new(
            self.slack.clone(),
            Arc::new(SqlMessageCacheRepository::new(self.db_pool.clone())),
            Arc::new(SqlGroupChannelRepository::new(self.db_pool.clone())),
            self.bot_identity.as_ref().map(|identity| identity.user_id.clone()),
            self.config.sync.page_sizes(),
        )
    }

    pub fn health_state(&self) -> HealthState {
        HealthState::new(self.db_pool.clone(), self.bot_identity.clone())
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("slack client setup failed: {0}")]
    SlackClient(#[source] SlackApiError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool =
        connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let client = SlackWebClient::new(&config.slack).map_err(BootstrapError::SlackClient)?;
    let slack: Arc<dyn SlackApi> = Arc::new(client);

    // Startup continues without an identity; mutation routes refuse until
    // the next restart resolves it.
    let bot_identity = match slack.auth_test().await {
        Ok(identity) => {
            info!(
                event_name = "system.bootstrap.slack_identity",
                correlation_id = "bootstrap",
                bot_user_id = %identity.user_id,
                team_id = %identity.team_id,
                "slack bot identity resolved"
            );
            Some(identity)
        }
        Err(error) => {
            warn!(
                event_name = "system.bootstrap.slack_identity_failed",
                correlation_id = "bootstrap",
                error = %error,
                "could not resolve slack bot identity"
            );
            None
        }
    };

    Ok(Application { config, db_pool, slack, bot_identity })
}
