use caucus_core::config::{AppConfig, LoadOptions};
use caucus_db::{connect_from_config, migrations, DbPool};
use caucus_slack::{SlackApi, SlackWebClient};
use serde::Serialize;

use crate::commands::{escape_json, new_runtime, CommandResult, Exit};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit = if report.overall_status == CheckStatus::Pass { Exit::Ok } else { Exit::ChecksFailed };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code: exit.code(), output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass(
                "config_validation",
                "configuration loaded and validated",
            ));
            checks.extend(check_services(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["database_connectivity", "migrations_current", "slack_auth"] {
                checks.push(DoctorCheck::skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_services(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match new_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            let details = format!("failed to initialize async runtime: {error}");
            return vec![
                DoctorCheck::fail("database_connectivity", details),
                DoctorCheck::skipped("migrations_current", "the async runtime did not start"),
                DoctorCheck::skipped("slack_auth", "the async runtime did not start"),
            ];
        }
    };

    runtime.block_on(async {
        let mut checks = Vec::new();

        match connect_from_config(&config.database).await {
            Ok(pool) => {
                checks.push(DoctorCheck::pass(
                    "database_connectivity",
                    format!("connected using `{}`", config.database.url),
                ));
                checks.push(check_migrations(&pool).await);
                pool.close().await;
            }
            Err(error) => {
                checks.push(DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to connect to database: {error}"),
                ));
                checks.push(DoctorCheck::skipped("migrations_current", "the database is unreachable"));
            }
        }

        checks.push(check_slack_auth(config).await);
        checks
    })
}

async fn check_migrations(pool: &DbPool) -> DoctorCheck {
    let expected: Vec<i64> = migrations::MIGRATOR
        .iter()
        .filter(|migration| !migration.migration_type.is_down_migration())
        .map(|migration| migration.version)
        .collect();

    match migrations::applied_versions(pool).await {
        Ok(applied) => {
            let pending: Vec<String> = expected
                .iter()
                .filter(|version| !applied.contains(version))
                .map(ToString::to_string)
                .collect();
            if pending.is_empty() {
                DoctorCheck::pass(
                    "migrations_current",
                    format!("{} migrations applied", applied.len()),
                )
            } else {
                DoctorCheck::fail(
                    "migrations_current",
                    format!("pending migrations: {} (run `caucus migrate`)", pending.join(", ")),
                )
            }
        }
        Err(error) => {
            DoctorCheck::fail("migrations_current", format!("could not read migrations: {error}"))
        }
    }
}

async fn check_slack_auth(config: &AppConfig) -> DoctorCheck {
    let client = match SlackWebClient::new(&config.slack) {
        Ok(client) => client,
        Err(error) => return DoctorCheck::fail("slack_auth", error.to_string()),
    };

    match client.auth_test().await {
        Ok(identity) => DoctorCheck::pass(
            "slack_auth",
            format!("bot user {} in team {}", identity.user_id, identity.team_id),
        ),
        Err(error) => DoctorCheck::fail("slack_auth", format!("auth.test failed: {error}")),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}
