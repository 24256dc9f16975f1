//! Data-access settings loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use sea_orm::DbBackend;
use serde::{Deserialize, Serialize};

use super::constants::{
    DEFAULT_CACHE_CLEANUP_INTERVAL_SECS, DEFAULT_CACHE_KEY_PREFIX, DEFAULT_CACHE_MAX_MEMORY_SIZE,
    DEFAULT_CACHE_OPERATION_TIMEOUT_MS, DEFAULT_CACHE_TTL_SECONDS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_DATABASE_URL, DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_MAX_OVERFLOW,
    DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_ATTEMPTS, DEFAULT_POOL_RECYCLE_SECS,
    DEFAULT_POOL_SIZE, DEFAULT_POOL_TIMEOUT_MS, DEFAULT_REDIS_URL, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_RETRY_INTERVAL_MS, DEFAULT_TRANSACTION_TIMEOUT_MS, MAX_POOL_CONNECTIONS,
};
use crate::errors::{DataError, DataResult};

// =============================================================================
// Connection
// =============================================================================

/// Connection pool configuration.
#[derive(Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    /// Target address of the database
    pub database_url: String,
    /// Connections kept open in the pool
    pub pool_size: u32,
    /// Extra connections allowed above `pool_size`
    pub max_overflow: u32,
    /// Wait limit for a free connection in milliseconds
    pub pool_timeout_ms: u64,
    /// Maximum connection age in seconds
    pub pool_recycle_secs: u64,
    /// Ping idle connections before handing them out
    pub pool_pre_ping: bool,
    /// Timeout for opening one connection in milliseconds
    pub connect_timeout_ms: u64,
    /// Reconnection attempts before the manager gives up
    pub max_retries: u32,
    /// Base reconnection delay in milliseconds
    pub retry_interval_ms: u64,
    /// Health check interval in milliseconds
    pub health_check_interval_ms: u64,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("database_url", &"[REDACTED]")
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("pool_timeout_ms", &self.pool_timeout_ms)
            .field("pool_recycle_secs", &self.pool_recycle_secs)
            .field("pool_pre_ping", &self.pool_pre_ping)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("max_retries", &self.max_retries)
            .field("retry_interval_ms", &self.retry_interval_ms)
            .field("health_check_interval_ms", &self.health_check_interval_ms)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            pool_timeout_ms: DEFAULT_POOL_TIMEOUT_MS,
            pool_recycle_secs: DEFAULT_POOL_RECYCLE_SECS,
            pool_pre_ping: true,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            health_check_interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    pub fn with_pool_size(mut self, pool_size: u32, max_overflow: u32) -> Self {
        self.pool_size = pool_size;
        self.max_overflow = max_overflow;
        self
    }

    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_pool_recycle(mut self, age: Duration) -> Self {
        self.pool_recycle_secs = age.as_secs();
        self
    }

    pub fn with_pre_ping(mut self, enabled: bool) -> Self {
        self.pool_pre_ping = enabled;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, interval: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }

    pub fn pool_recycle(&self) -> Duration {
        Duration::from_secs(self.pool_recycle_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Wait after reconnection attempt `attempt` (1-based): `retry_interval * attempt`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_interval_ms.saturating_mul(attempt as u64))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Hard cap on simultaneously open connections.
    pub fn max_connections(&self) -> usize {
        (self.pool_size as usize).saturating_add(self.max_overflow as usize)
    }

    /// SQL dialect implied by the URL scheme.
    pub fn backend(&self) -> DbBackend {
        let scheme = self.database_url.split(':').next().unwrap_or_default();
        match scheme {
            "mysql" | "mariadb" => DbBackend::MySql,
            "sqlite" => DbBackend::Sqlite,
            _ => DbBackend::Postgres,
        }
    }

    /// Short database kind used in error reports and logs.
    pub fn database_kind(&self) -> &'static str {
        match self.backend() {
            DbBackend::MySql => "mysql",
            DbBackend::Sqlite => "sqlite",
            _ => "postgres",
        }
    }

    pub fn validate(&self) -> DataResult<()> {
        if self.pool_size == 0 {
            return Err(DataError::config("pool_size must be greater than 0"));
        }
        match self.pool_size.checked_add(self.max_overflow) {
            Some(total) if total <= MAX_POOL_CONNECTIONS => {}
            _ => {
                return Err(DataError::config(format!(
                    "pool_size + max_overflow must not exceed {}",
                    MAX_POOL_CONNECTIONS
                )))
            }
        }
        if self.max_retries == 0 {
            return Err(DataError::config("max_retries must be greater than 0"));
        }
        if self.health_check_interval_ms == 0 {
            return Err(DataError::config(
                "health_check_interval must be greater than 0",
            ));
        }
        if self.pool_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(DataError::config("timeouts must be greater than 0"));
        }
        Ok(())
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Storage strategy behind the cache manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
}

impl FromStr for CacheBackendKind {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(DataError::config(format!("unknown cache backend: {}", other))),
        }
    }
}

/// Codec used for cached values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializeMethod {
    Json,
}

impl FromStr for SerializeMethod {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            other => Err(DataError::config(format!(
                "unsupported serialize method: {}",
                other
            ))),
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: String,
    /// Default TTL in seconds; 0 stores entries without expiry
    pub default_ttl_seconds: u64,
    /// Entry limit of the in-memory backend
    pub max_memory_size: usize,
    pub key_prefix: String,
    pub serialize_method: SerializeMethod,
    pub enable_stats: bool,
    pub cleanup_interval_seconds: u64,
    pub operation_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            default_ttl_seconds: DEFAULT_CACHE_TTL_SECONDS,
            max_memory_size: DEFAULT_CACHE_MAX_MEMORY_SIZE,
            key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            serialize_method: SerializeMethod::Json,
            enable_stats: true,
            cleanup_interval_seconds: DEFAULT_CACHE_CLEANUP_INTERVAL_SECS,
            operation_timeout_ms: DEFAULT_CACHE_OPERATION_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn redis(url: impl Into<String>) -> Self {
        Self {
            backend: CacheBackendKind::Redis,
            redis_url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_seconds = ttl.as_secs();
        self
    }

    pub fn with_max_memory_size(mut self, max: usize) -> Self {
        self.max_memory_size = max;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_stats(mut self, enabled: bool) -> Self {
        self.enable_stats = enabled;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval_seconds = interval.as_secs().max(1);
        self
    }

    /// Default TTL, `None` when entries should not expire.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_seconds > 0).then(|| Duration::from_secs(self.default_ttl_seconds))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> DataResult<()> {
        if self.max_memory_size == 0 {
            return Err(DataError::config("max_memory_size must be greater than 0"));
        }
        Ok(())
    }
}

// =============================================================================
// Unit of Work
// =============================================================================

/// Transaction behaviour of units of work created by the factory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UnitOfWorkConfig {
    /// Commit automatically when a scoped transaction returns `Ok`
    pub auto_commit: bool,
    /// Roll back when an operation inside the unit of work fails
    pub rollback_on_error: bool,
    pub transaction_timeout_ms: u64,
    /// Total attempts made by `execute_with_retry`
    pub max_retry_attempts: u32,
    /// Base retry delay in milliseconds, doubled per attempt
    pub retry_delay_ms: u64,
}

impl Default for UnitOfWorkConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            rollback_on_error: true,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl UnitOfWorkConfig {
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.max_retry_attempts = attempts.max(1);
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    pub fn with_rollback_on_error(mut self, enabled: bool) -> Self {
        self.rollback_on_error = enabled;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based): `retry_delay * 2^attempt`.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Complete data-access configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub cache: CacheConfig,
    pub unit_of_work: UnitOfWorkConfig,
}

impl Settings {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> DataResult<Self> {
        dotenvy::dotenv().ok();

        let connection = ConnectionConfig {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
            pool_size: parse_env("DB_POOL_SIZE", DEFAULT_POOL_SIZE),
            max_overflow: parse_env("DB_MAX_OVERFLOW", DEFAULT_MAX_OVERFLOW),
            pool_timeout_ms: parse_env("DB_POOL_TIMEOUT_MS", DEFAULT_POOL_TIMEOUT_MS),
            pool_recycle_secs: parse_env("DB_POOL_RECYCLE_SECS", DEFAULT_POOL_RECYCLE_SECS),
            pool_pre_ping: parse_env("DB_POOL_PRE_PING", true),
            connect_timeout_ms: parse_env("DB_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS),
            max_retries: parse_env("DB_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            retry_interval_ms: parse_env("DB_RETRY_INTERVAL_MS", DEFAULT_RETRY_INTERVAL_MS),
            health_check_interval_ms: parse_env(
                "DB_HEALTH_CHECK_INTERVAL_MS",
                DEFAULT_HEALTH_CHECK_INTERVAL_MS,
            ),
        };
        connection.validate()?;

        let cache = CacheConfig {
            backend: match env::var("CACHE_BACKEND") {
                Ok(value) => value.parse()?,
                Err(_) => CacheBackendKind::Memory,
            },
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            default_ttl_seconds: parse_env("CACHE_DEFAULT_TTL_SECS", DEFAULT_CACHE_TTL_SECONDS),
            max_memory_size: parse_env("CACHE_MAX_MEMORY_SIZE", DEFAULT_CACHE_MAX_MEMORY_SIZE),
            key_prefix: env::var("CACHE_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_CACHE_KEY_PREFIX.to_string()),
            serialize_method: match env::var("CACHE_SERIALIZE_METHOD") {
                Ok(value) => value.parse()?,
                Err(_) => SerializeMethod::Json,
            },
            enable_stats: parse_env("CACHE_ENABLE_STATS", true),
            cleanup_interval_seconds: parse_env(
                "CACHE_CLEANUP_INTERVAL_SECS",
                DEFAULT_CACHE_CLEANUP_INTERVAL_SECS,
            ),
            operation_timeout_ms: parse_env(
                "CACHE_OPERATION_TIMEOUT_MS",
                DEFAULT_CACHE_OPERATION_TIMEOUT_MS,
            ),
        };
        cache.validate()?;

        let unit_of_work = UnitOfWorkConfig {
            auto_commit: parse_env("UOW_AUTO_COMMIT", true),
            rollback_on_error: parse_env("UOW_ROLLBACK_ON_ERROR", true),
            transaction_timeout_ms: parse_env(
                "UOW_TRANSACTION_TIMEOUT_MS",
                DEFAULT_TRANSACTION_TIMEOUT_MS,
            ),
            max_retry_attempts: parse_env("UOW_MAX_RETRY_ATTEMPTS", DEFAULT_MAX_RETRY_ATTEMPTS)
                .max(1),
            retry_delay_ms: parse_env("UOW_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS),
        };

        Ok(Self {
            connection,
            cache,
            unit_of_work,
        })
    }
}

/// Read and parse an environment variable, falling back to `default`.
fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}
