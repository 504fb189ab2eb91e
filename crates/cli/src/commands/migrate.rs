use caucus_db::migrations;

use crate::commands::{execute, open_database, CommandFailure, CommandResult};

pub fn run() -> CommandResult {
    execute(
        "migrate",
        |config| async move {
            let pool = open_database(&config).await?;
            let applied =
                migrations::applied_versions(&pool).await.map_err(CommandFailure::migration);
            pool.close().await;
            applied.map(|versions| versions.len())
        },
        |applied| {
            CommandResult::success(
                "migrate",
                format!("applied pending migrations ({applied} recorded)"),
            )
        },
    )
}
