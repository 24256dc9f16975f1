use std::time::Duration;

use async_trait::async_trait;

use super::stats::CacheStats;

#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;

/// Storage strategy behind [`CacheManager`](super::CacheManager).
///
/// Backends deal in fully normalized keys and encoded payloads. Failures are
/// counted in the backend's statistics and reported as a miss, `false` or an
/// empty result; they never reach the caller as errors.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Option<String>;

    /// Store `value`. A `ttl` of `None` stores it without expiry.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> bool;

    async fn delete(&self, key: &str) -> bool;

    async fn exists(&self, key: &str) -> bool;

    async fn clear(&self) -> bool;

    /// Live keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Vec<String>;

    fn stats(&self) -> CacheStats;

    fn reset_stats(&self);

    /// Count a failure that happened outside the backend, e.g. while encoding.
    fn record_error(&self);

    /// Count a payload returned by `get` that could not be decoded: the hit
    /// recorded for it becomes an error.
    fn record_decode_error(&self);

    /// Stop background work owned by the backend.
    async fn shutdown(&self);
}
