use roundkeeper_core::config::LoadOptions;
use roundkeeper_db::migrations;
use tracing::info;

use crate::commands::{connect_pool, execute, CommandResult, Failure};

pub fn run(options: &LoadOptions) -> CommandResult {
    execute(
        "migrate",
        options,
        |config| async move {
            let pool = connect_pool(&config).await?;
            migrations::run_pending(&pool)
                .await
                .map_err(|error| Failure::storage("migration", error.to_string()))?;
            pool.close().await;
            info!(
                event_name = "cli.migrate.completed",
                correlation_id = "bootstrap",
                database_url = %config.database.url,
                "migrations applied"
            );
            Ok(())
        },
        |()| CommandResult::success("migrate", "applied pending migrations"),
    )
}
