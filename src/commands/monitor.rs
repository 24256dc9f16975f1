//! Monitor command - Periodic pool and connection reports.

use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};

use crate::cli::args::MonitorArgs;
use crate::config::Settings;
use crate::errors::{DataError, DataResult};
use crate::infra::{ConnectionManager, ConnectionState, PoolStatus};

#[derive(Serialize)]
struct Report {
    tick: u64,
    state: ConnectionState,
    retry_count: u32,
    pool: Option<PoolStatus>,
}

/// Execute the monitor command
pub async fn execute(args: MonitorArgs, settings: Settings) -> DataResult<()> {
    if args.interval == 0 {
        return Err(DataError::validation("interval must be at least one second"));
    }

    let connections = ConnectionManager::new(settings.connection)?;
    connections.initialize().await?;
    tracing::info!(interval_secs = args.interval, "Monitoring connection pool (Ctrl-C to stop)");

    let mut ticker = interval(Duration::from_secs(args.interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }

        tick += 1;
        let report = Report {
            tick,
            state: connections.state(),
            retry_count: connections.retry_count(),
            pool: connections.get_pool_status(),
        };
        super::print_json(&report, true)?;

        if args.ticks.is_some_and(|limit| tick >= limit) {
            break;
        }
    }

    connections.shutdown().await;
    Ok(())
}
