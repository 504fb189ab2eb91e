use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use caucus_db::DbPool;
use caucus_slack::web::BotIdentity;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    bot_identity: Option<BotIdentity>,
}

impl HealthState {
    pub fn new(db_pool: DbPool, bot_identity: Option<BotIdentity>) -> Self {
        Self { db_pool, bot_identity }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub slack: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Only the database gates readiness. An unknown bot identity still serves
/// reads, so it degrades the report without failing it.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let slack = slack_check(state.bot_identity.as_ref());
    let database_ready = database.status == "ready";

    let status = if database_ready && slack.status == "ready" { "ready" } else { "degraded" };
    let payload =
        HealthResponse { status, database, slack, checked_at: Utc::now().to_rfc3339() };

    let status_code = if database_ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await {
        Ok(_) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn slack_check(identity: Option<&BotIdentity>) -> HealthCheck {
    match identity {
        Some(identity) => HealthCheck {
            status: "ready",
            detail: format!("bot user {} in team {}", identity.user_id, identity.team_id),
        },
        None => HealthCheck {
            status: "degraded",
            detail: "bot identity unknown; edits and deletes are disabled".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use axum::{extract::State, http::StatusCode, Json};
    use caucus_core::domain::message::SlackUserId;
    use caucus_db::connect_with_settings;
    use caucus_slack::web::BotIdentity;

    use crate::health::{health, HealthState};

    fn identity() -> BotIdentity {
        BotIdentity { user_id: SlackUserId("UBOT".into()), team_id: "T1".into(), bot_id: None }
    }

    #[tokio::test]
    async fn health_returns_ready_when_database_and_slack_are_reachable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) =
            health(State(HealthState::new(pool.clone(), Some(identity())))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "ready");
        assert_eq!(payload.database.status, "ready");
        assert!(payload.slack.detail.contains("UBOT"));

        pool.close().await;
    }

    #[tokio::test]
    async fn unknown_bot_identity_degrades_without_failing() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");

        let (status, Json(payload)) = health(State(HealthState::new(pool.clone(), None))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.slack.status, "degraded");

        pool.close().await;
    }

    #[tokio::test]
    async fn health_returns_service_unavailable_when_database_is_unavailable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool should connect");
        pool.close().await;

        let (status, Json(payload)) = health(State(HealthState::new(pool, Some(identity())))).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(payload.status, "degraded");
        assert_eq!(payload.database.status, "degraded");
    }
}
