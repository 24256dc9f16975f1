//! Cache-stats command - Exercise the configured cache backend.

use crate::cli::args::CacheStatsArgs;
use crate::config::Settings;
use crate::errors::DataResult;
use crate::infra::CacheManager;

const SAMPLE_NAMESPACE: &str = "cache-stats";

/// Execute the cache-stats command
///
/// Writes `samples` keys, reads each back, reads as many missing keys and
/// removes the sample namespace again before printing the counters.
pub async fn execute(args: CacheStatsArgs, settings: Settings) -> DataResult<()> {
    let cache = CacheManager::connect(settings.cache).await?;
    tracing::info!(backend = cache.backend_name(), samples = args.samples, "Running cache workload");

    for i in 0..args.samples {
        let key = CacheManager::make_key(&[SAMPLE_NAMESPACE, &i.to_string()]);
        cache.set(&key, &i, None).await?;
    }
    for i in 0..args.samples {
        let hit = CacheManager::make_key(&[SAMPLE_NAMESPACE, &i.to_string()]);
        let miss = CacheManager::make_key(&[SAMPLE_NAMESPACE, "missing", &i.to_string()]);
        cache.get::<usize>(&hit).await?;
        cache.get::<usize>(&miss).await?;
    }

    let removed = cache
        .invalidate_pattern(&format!("{}:*", SAMPLE_NAMESPACE))
        .await;
    tracing::debug!(removed, "Sample keys removed");

    super::print_json(&cache.get_stats(), false)?;
    cache.shutdown().await;
    Ok(())
}
