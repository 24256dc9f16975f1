//! Connection state, metrics and read-only status snapshots.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RESPONSE_TIME_WINDOW;

/// Lifecycle state of the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Counters mutated by the connection manager and its health loop.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    total_connections: u64,
    failed_connections: u64,
    total_queries: u64,
    failed_queries: u64,
    response_times_ms: VecDeque<f64>,
    last_health_check: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    pub fn record_connection_attempt(&mut self, succeeded: bool) {
        self.total_connections += 1;
        if !succeeded {
            self.failed_connections += 1;
        }
    }

    pub fn record_query(&mut self, elapsed: Duration, succeeded: bool) {
        self.total_queries += 1;
        if !succeeded {
            self.failed_queries += 1;
        }
        self.record_response_time(elapsed);
    }

    pub fn record_health_check(&mut self, elapsed: Duration) {
        self.last_health_check = Some(Utc::now());
        self.record_response_time(elapsed);
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        if self.response_times_ms.len() == RESPONSE_TIME_WINDOW {
            self.response_times_ms.pop_front();
        }
        self.response_times_ms
            .push_back(elapsed.as_secs_f64() * 1000.0);
    }

    /// Mean of the last `RESPONSE_TIME_WINDOW` samples.
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.response_times_ms.is_empty() {
            return 0.0;
        }
        self.response_times_ms.iter().sum::<f64>() / self.response_times_ms.len() as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_connections: self.total_connections,
            failed_connections: self.failed_connections,
            total_queries: self.total_queries,
            failed_queries: self.failed_queries,
            avg_response_time_ms: self.avg_response_time_ms(),
            last_health_check: self.last_health_check,
        }
    }
}

/// Point-in-time copy of [`ConnectionMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_connections: u64,
    pub failed_connections: u64,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub avg_response_time_ms: f64,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub max_overflow: usize,
    /// Connections currently lent out
    pub in_use: usize,
    /// Open connections waiting in the pool
    pub idle: usize,
    /// Open connections above `pool_size`
    pub overflow: usize,
    pub total_open: usize,
}

/// Health report returned by `get_health_status`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub state: ConnectionState,
    pub healthy: bool,
    pub database: &'static str,
    pub retry_count: u32,
    pub active_sessions: usize,
    pub last_error: Option<String>,
    pub pool: Option<PoolStatus>,
    pub metrics: MetricsSnapshot,
}
