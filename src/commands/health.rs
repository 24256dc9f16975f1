//! Health command - One-shot database check.

use crate::cli::args::HealthArgs;
use crate::config::Settings;
use crate::errors::{DataError, DataResult};
use crate::infra::ConnectionManager;

/// Execute the health command
pub async fn execute(args: HealthArgs, settings: Settings) -> DataResult<()> {
    tracing::info!("Checking database health...");

    let connections = ConnectionManager::new(settings.connection)?;
    connections.initialize().await?;

    let healthy = connections.perform_health_check().await;
    let report = connections.get_health_status();
    connections.shutdown().await;

    super::print_json(&report, args.compact)?;

    if healthy {
        tracing::info!("Database is healthy");
        Ok(())
    } else {
        Err(DataError::connection(
            report.database,
            "health_check",
            report.last_error.unwrap_or_else(|| "health check failed".to_string()),
        ))
    }
}
