//! Cache abstraction over pluggable backends.
//!
//! [`CacheManager`] normalizes keys, encodes values as JSON and delegates to
//! the backend chosen in [`CacheConfig`]. A miss is `Ok(None)`; only encoding
//! failures surface as errors, and they are counted in the backend's stats.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

mod backend;
mod item;
mod memory;
mod remote;
mod stats;

pub use backend::CacheBackend;
pub use item::CacheItem;
pub use memory::MemoryCacheBackend;
pub use remote::RemoteCacheBackend;
pub use stats::{CacheStats, StatsRecorder};

#[cfg(any(test, feature = "test-utils"))]
pub use backend::MockCacheBackend;

use crate::config::{CacheBackendKind, CacheConfig, CACHE_KEY_SEPARATOR, MAX_CACHE_KEY_LENGTH};
use crate::errors::DataResult;

/// Shared cache handle. Cheap to clone.
#[derive(Clone)]
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    config: Arc<CacheConfig>,
}

impl CacheManager {
    /// Build the backend named in `config`.
    ///
    /// The memory backend starts its sweeper, so this must run inside a Tokio
    /// runtime.
    pub async fn connect(config: CacheConfig) -> DataResult<Self> {
        config.validate()?;
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => {
                let backend = MemoryCacheBackend::new(config.max_memory_size, config.enable_stats);
                backend.start_sweeper(config.cleanup_interval());
                Arc::new(backend)
            }
            CacheBackendKind::Redis => Arc::new(
                RemoteCacheBackend::connect(
                    &config.redis_url,
                    config.key_prefix.clone(),
                    config.operation_timeout(),
                    config.enable_stats,
                )
                .await?,
            ),
        };
        info!(backend = backend.name(), prefix = %config.key_prefix, "Cache initialized");
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Join key parts with `:`, e.g. `make_key(&["user", "42"])` → `"user:42"`.
    pub fn make_key(parts: &[&str]) -> String {
        parts.join(CACHE_KEY_SEPARATOR)
    }

    /// Prefix a key and hash its tail when it is too long for the store.
    ///
    /// The first segment survives hashing, so `user:*` still matches a
    /// hashed `user:` key.
    pub fn normalize_key(&self, key: &str) -> String {
        let prefix = &self.config.key_prefix;
        let full = format!("{}{}", prefix, key);
        if full.len() <= MAX_CACHE_KEY_LENGTH {
            return full;
        }

        let digest = format!("{:x}", Sha256::digest(full.as_bytes()));
        match key.split_once(CACHE_KEY_SEPARATOR) {
            Some((namespace, _))
                if prefix.len() + namespace.len() + CACHE_KEY_SEPARATOR.len() + digest.len()
                    <= MAX_CACHE_KEY_LENGTH =>
            {
                format!("{}{}{}{}", prefix, namespace, CACHE_KEY_SEPARATOR, digest)
            }
            _ => format!("{}{}", prefix, digest),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> DataResult<Option<T>> {
        let key = self.normalize_key(key);
        let Some(payload) = self.backend.get(&key).await else {
            return Ok(None);
        };
        match serde_json::from_str(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(%key, "Cached payload could not be decoded: {}", e);
                self.backend.record_decode_error();
                Err(e.into())
            }
        }
    }

    /// Store a value. `ttl` of `None` uses the configured default;
    /// `Some(Duration::ZERO)` stores without expiry.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> DataResult<bool> {
        let payload = serde_json::to_string(value).map_err(|e| {
            self.backend.record_error();
            e
        })?;
        let ttl = match ttl {
            Some(ttl) if ttl.is_zero() => None,
            Some(ttl) => Some(ttl),
            None => self.config.default_ttl(),
        };
        Ok(self.backend.set(&self.normalize_key(key), payload, ttl).await)
    }

    pub async fn delete(&self, key: &str) -> bool {
        self.backend.delete(&self.normalize_key(key)).await
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.backend.exists(&self.normalize_key(key)).await
    }

    pub async fn clear(&self) -> bool {
        self.backend.clear().await
    }

    /// Delete every key matching a glob pattern. Returns how many were removed.
    ///
    /// Keys are listed first and then deleted one by one, so writes racing
    /// with the call may survive it.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let pattern = format!("{}{}", self.config.key_prefix, pattern);
        let keys = self.backend.keys(&pattern).await;

        let mut removed = 0;
        for key in keys {
            if self.backend.delete(&key).await {
                removed += 1;
            }
        }
        debug!(%pattern, removed, "Invalidated cache pattern");
        removed
    }

    pub fn get_stats(&self) -> CacheStats {
        self.backend.stats()
    }

    pub fn reset_stats(&self) {
        self.backend.reset_stats();
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Errors from `compute` are returned and nothing is cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> DataResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        if let Some(value) = self.get::<T>(key).await? {
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
        info!(backend = self.backend.name(), "Cache shut down");
    }
}

/// Wrap an async function so its results are cached.
///
/// `key_fn` derives the cache key from the argument; the wrapped function only
/// runs on a miss.
pub fn cached<A, T, K, F, Fut>(
    cache: CacheManager,
    ttl: Option<Duration>,
    key_fn: K,
    f: F,
) -> impl Fn(A) -> BoxFuture<'static, DataResult<T>>
where
    A: Send + 'static,
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
    K: Fn(&A) -> String,
    F: Fn(A) -> Fut,
    Fut: Future<Output = DataResult<T>> + Send + 'static,
{
    move |arg: A| {
        let cache = cache.clone();
        let key = key_fn(&arg);
        let pending = f(arg);
        Box::pin(async move { cache.get_or_compute(&key, ttl, move || pending).await })
    }
}
