//! Redis-backed cache.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisResult};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::backend::CacheBackend;
use super::stats::{CacheStats, StatsRecorder};
use crate::errors::{DataError, DataResult};

/// Cache backend over a shared Redis connection.
///
/// Every command is bounded by the operation timeout. Failures are logged,
/// counted and degrade to a miss / `false` / empty result.
pub struct RemoteCacheBackend {
    connection: ConnectionManager,
    key_prefix: String,
    op_timeout: Duration,
    stats: StatsRecorder,
}

impl RemoteCacheBackend {
    /// Connect to Redis. Unlike individual commands, a failed connect is an error.
    pub async fn connect(
        url: &str,
        key_prefix: impl Into<String>,
        op_timeout: Duration,
        enable_stats: bool,
    ) -> DataResult<Self> {
        let client = Client::open(url).map_err(|e| DataError::cache("connect", e.to_string()))?;

        let connection = match timeout(op_timeout.max(Duration::from_secs(5)), ConnectionManager::new(client)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(DataError::cache("connect", e.to_string())),
            Err(_) => return Err(DataError::cache("connect", "timed out connecting to redis")),
        };

        info!("Redis cache connected");

        Ok(Self {
            connection,
            key_prefix: key_prefix.into(),
            op_timeout,
            stats: StatsRecorder::new(enable_stats),
        })
    }

    /// `None` when the listing itself failed, as opposed to matching nothing.
    async fn list_keys(&self, pattern: &str) -> Option<Vec<String>> {
        let mut conn = self.connection.clone();
        self.run("keys", async move { conn.keys::<_, Vec<String>>(pattern).await })
            .await
    }

    async fn run<T, F>(&self, operation: &'static str, command: F) -> Option<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match timeout(self.op_timeout, command).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.stats.record_error();
                warn!(operation, "Redis command failed: {}", e);
                None
            }
            Err(_) => {
                self.stats.record_error();
                warn!(operation, timeout_ms = self.op_timeout.as_millis() as u64, "Redis command timed out");
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RemoteCacheBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.connection.clone();
        let value = self
            .run("get", async move { conn.get::<_, Option<String>>(key).await })
            .await
            .flatten();

        match value {
            Some(value) => {
                self.stats.record_hit();
                Some(value)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> bool {
        let mut conn = self.connection.clone();
        let stored = self
            .run("set", async move {
                match ttl {
                    Some(ttl) => {
                        let millis = (ttl.as_millis() as u64).max(1);
                        conn.pset_ex::<_, _, ()>(key, value, millis).await
                    }
                    None => conn.set::<_, _, ()>(key, value).await,
                }
            })
            .await
            .is_some();

        if stored {
            self.stats.record_set();
        }
        stored
    }

    async fn delete(&self, key: &str) -> bool {
        let mut conn = self.connection.clone();
        let removed = self
            .run("delete", async move { conn.del::<_, i64>(key).await })
            .await
            .is_some_and(|count| count > 0);

        if removed {
            self.stats.record_delete();
        }
        removed
    }

    async fn exists(&self, key: &str) -> bool {
        let mut conn = self.connection.clone();
        self.run("exists", async move { conn.exists::<_, bool>(key).await })
            .await
            .unwrap_or(false)
    }

    /// Delete every key under this backend's prefix. `false` if the keys cannot be listed.
    async fn clear(&self) -> bool {
        let pattern = format!("{}*", self.key_prefix);
        let keys = match ClearPlan::from_listing(self.list_keys(&pattern).await) {
            ClearPlan::ListingFailed => return false,
            ClearPlan::Nothing => return true,
            ClearPlan::Delete(keys) => keys,
        };

        let mut conn = self.connection.clone();
        let count = keys.len();
        let cleared = self
            .run("clear", async move { conn.del::<_, i64>(keys).await })
            .await
            .is_some();
        if cleared {
            debug!(count, "Cleared redis cache keys");
        }
        cleared
    }

    async fn keys(&self, pattern: &str) -> Vec<String> {
        self.list_keys(pattern).await.unwrap_or_default()
    }

    fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    fn reset_stats(&self) {
        self.stats.reset();
    }

    fn record_error(&self) {
        self.stats.record_error();
    }

    fn record_decode_error(&self) {
        self.stats.revoke_hit();
    }

    async fn shutdown(&self) {
        debug!("Redis cache backend released");
    }
}

#[derive(Debug, PartialEq)]
enum ClearPlan {
    ListingFailed,
    Nothing,
    Delete(Vec<String>),
}

impl ClearPlan {
    fn from_listing(listed: Option<Vec<String>>) -> Self {
        match listed {
            None => Self::ListingFailed,
            Some(keys) if keys.is_empty() => Self::Nothing,
            Some(keys) => Self::Delete(keys),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_listing_is_not_an_empty_cache() {
        assert_eq!(ClearPlan::from_listing(None), ClearPlan::ListingFailed);
        assert_eq!(ClearPlan::from_listing(Some(vec![])), ClearPlan::Nothing);
        assert_eq!(
            ClearPlan::from_listing(Some(vec!["app:a".to_string()])),
            ClearPlan::Delete(vec!["app:a".to_string()])
        );
    }
}
