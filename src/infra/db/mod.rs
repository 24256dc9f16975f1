//! Database connection management.
//!
//! [`ConnectionManager`] owns the pool, tracks connection state, runs the
//! periodic health check and reconnects with linear backoff when a check
//! fails. Once shutdown has begun no new pool is installed.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use sea_orm::{JsonValue, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod metrics;
pub mod pool;
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use connection::{Connector, SeaOrmConnector, StorageConnection};
pub use metrics::{ConnectionState, HealthStatus, MetricsSnapshot, PoolStatus};
pub use pool::ConnectionPool;
pub use session::{Session, SessionCoordinator, SessionHandle};

#[cfg(any(test, feature = "test-utils"))]
pub use connection::{MockConnector, MockStorageConnection};

use crate::config::ConnectionConfig;
use crate::errors::{DataError, DataResult};
use metrics::ConnectionMetrics;

/// Connection manager handle. Cheap to clone; clones share one pool.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<ConnectionState>,
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    metrics: Mutex<ConnectionMetrics>,
    coordinator: Arc<SessionCoordinator>,
    retry_count: AtomicU32,
    last_error: Mutex<Option<String>>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Manager backed by SeaORM connections to `config.database_url`.
    pub fn new(config: ConnectionConfig) -> DataResult<Self> {
        let connector = Arc::new(SeaOrmConnector::new(&config));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn Connector>) -> DataResult<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                connector,
                state: Mutex::new(ConnectionState::Disconnected),
                pool: RwLock::new(None),
                metrics: Mutex::new(ConnectionMetrics::default()),
                coordinator: Arc::new(SessionCoordinator::new()),
                retry_count: AtomicU32::new(0),
                last_error: Mutex::new(None),
                shutting_down: AtomicBool::new(false),
                shutdown_tx,
                health_task: Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// Open the pool, verify it with a ping and start the health monitor.
    pub async fn initialize(&self) -> DataResult<()> {
        self.ensure_running("initialize")?;
        {
            let mut state = self.inner.state.lock();
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(self.error("initialize", "connection manager is shut down"));
            }
            match *state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(self.error("initialize", "a connection attempt is already in progress"))
                }
                ConnectionState::Disconnected | ConnectionState::Error => {}
            }
            *state = ConnectionState::Connecting;
        }
        info!(
            database = self.inner.config.database_kind(),
            pool_size = self.inner.config.pool_size,
            max_overflow = self.inner.config.max_overflow,
            "Initializing database connection"
        );

        match self.inner.establish().await {
            Ok(pool) => {
                if !self.inner.install(pool).await {
                    info!("Shutdown started while connecting, new pool discarded");
                    return Err(self.error("initialize", "connection manager is shut down"));
                }
                self.inner.retry_count.store(0, Ordering::SeqCst);
                *self.inner.last_error.lock() = None;
                self.start_health_monitor();
                info!("Database connection established");
                Ok(())
            }
            Err(e) => {
                self.inner.record_error(&e);
                self.inner.set_state(ConnectionState::Error);
                error!("Database initialization failed: {}", e);
                Err(e)
            }
        }
    }

    /// Borrow a session. Only allowed while connected.
    pub async fn get_session(&self) -> DataResult<Session> {
        self.ensure_running("get_session")?;
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(self.error(
                "get_session",
                format!("database is not available (state: {})", state),
            ));
        }

        let pool = self
            .current_pool()
            .ok_or_else(|| self.error("get_session", "connection pool is not initialized"))?;
        let checkout = pool.acquire().await.map_err(|e| {
            self.inner.record_error(&e);
            e
        })?;
        Ok(Session::open(checkout, pool, self.inner.coordinator.clone()))
    }

    /// Run `f` with a session that is released afterwards, whatever the outcome.
    pub async fn with_session<F, Fut, T>(&self, f: F) -> DataResult<T>
    where
        F: FnOnce(SessionHandle) -> Fut,
        Fut: std::future::Future<Output = DataResult<T>>,
    {
        let session = self.get_session().await?;
        let result = f(session.handle()).await;
        session.release().await;
        result
    }

    /// Run a raw query and return its rows, recording timing metrics.
    pub async fn execute_query(&self, sql: &str, params: Vec<Value>) -> DataResult<Vec<JsonValue>> {
        let started = Instant::now();
        let result = self
            .with_session(|session| async move {
                let statement = session.statement(sql, params);
                session.query(statement).await
            })
            .await;

        self.inner
            .metrics
            .lock()
            .record_query(started.elapsed(), result.is_ok());

        result.map_err(|e| {
            error!(sql, "Query failed: {}", e);
            match e {
                DataError::Connection { .. } => e,
                other => self.error("execute_query", other.to_string()),
            }
        })
    }

    /// Ping the database once. Returns `false` on any failure.
    ///
    /// A pool whose every connection is lent out is busy, not down: the
    /// check is skipped and reported as passed.
    pub async fn perform_health_check(&self) -> bool {
        let Some(pool) = self.current_pool() else {
            return false;
        };

        match pool.check().await {
            Ok(Some(elapsed)) => {
                self.inner.metrics.lock().record_health_check(elapsed);
                debug!(elapsed_ms = elapsed.as_millis() as u64, "Health check passed");
                true
            }
            Ok(None) => {
                debug!("All connections in use, skipping health check");
                true
            }
            Err(e) => {
                self.inner.record_error(&e);
                warn!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Replace the pool, retrying up to `max_retries` times.
    ///
    /// Attempt `n` waits `retry_interval * n` before the next one. Only one
    /// reconnection runs at a time.
    pub async fn reconnect(&self) -> DataResult<()> {
        self.ensure_running("reconnect")?;
        {
            let mut state = self.inner.state.lock();
            if self.inner.shutting_down.load(Ordering::SeqCst) {
                return Err(self.error("reconnect", "connection manager is shut down"));
            }
            if *state == ConnectionState::Reconnecting {
                info!("Reconnection already in progress");
                return Err(self.error("reconnect", "reconnection already in progress"));
            }
            *state = ConnectionState::Reconnecting;
        }
        warn!(database = self.inner.config.database_kind(), "Reconnecting to database");

        let previous = self.inner.pool.write().take();
        if let Some(previous) = previous {
            previous.dispose().await;
        }

        let max_retries = self.inner.config.max_retries;
        let mut last_error = None;
        for attempt in 1..=max_retries {
            self.inner.retry_count.store(attempt, Ordering::SeqCst);

            match self.inner.establish().await {
                Ok(pool) => {
                    if !self.inner.install(pool).await {
                        info!("Shutdown started while reconnecting, new pool discarded");
                        return Err(self.error("reconnect", "connection manager is shut down"));
                    }
                    self.inner.retry_count.store(0, Ordering::SeqCst);
                    *self.inner.last_error.lock() = None;
                    info!(attempt, "Reconnected to database");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, max_retries, "Reconnection attempt failed: {}", e);
                    self.inner.record_error(&e);
                    last_error = Some(e);
                }
            }

            if attempt < max_retries {
                let delay = self.inner.config.reconnect_delay(attempt);
                if !self.inner.pause(delay).await {
                    info!("Reconnection interrupted by shutdown");
                    return Err(self.error("reconnect", "connection manager is shut down"));
                }
            }
        }

        self.inner.set_state(ConnectionState::Error);
        let attempts = self.retry_count();
        error!(attempts, "Reconnection failed, giving up");
        Err(last_error
            .unwrap_or_else(|| self.error("reconnect", "reconnection aborted"))
            .with_retries(attempts))
    }

    pub fn get_pool_status(&self) -> Option<PoolStatus> {
        self.current_pool().map(|pool| pool.status())
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let state = self.state();
        HealthStatus {
            state,
            healthy: state == ConnectionState::Connected,
            database: self.inner.config.database_kind(),
            retry_count: self.retry_count(),
            active_sessions: self.inner.coordinator.active_count(),
            last_error: self.inner.last_error.lock().clone(),
            pool: self.get_pool_status(),
            metrics: self.inner.metrics.lock().snapshot(),
        }
    }

    /// Stop the health monitor, close every live session and dispose the pool.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down connection manager");
        self.inner.shutdown_tx.send_replace(true);

        let task = self.inner.health_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Health monitor ended abnormally: {}", e);
            }
        }

        let closed = self.inner.coordinator.close_all().await;
        if closed > 0 {
            warn!(sessions = closed, "Closed sessions that were still open");
        }

        // Under the state lock so a concurrent install either lands first or sees the flag.
        let pool = {
            let _state = self.inner.state.lock();
            self.inner.pool.write().take()
        };
        if let Some(pool) = pool {
            pool.dispose().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
        info!("Connection manager shut down");
    }

    fn start_health_monitor(&self) {
        let mut slot = self.inner.health_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let period = self.inner.config.health_check_interval();
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.run_health_tick().await;
            }
            debug!("Health monitor stopped");
        }));
    }

    async fn run_health_tick(&self) {
        let state = self.state();
        if state != ConnectionState::Connected {
            debug!(%state, "Skipping health check");
            return;
        }
        if !self.perform_health_check().await {
            if let Err(e) = self.reconnect().await {
                error!("Automatic reconnection failed: {}", e);
            }
        }
    }

    fn current_pool(&self) -> Option<Arc<ConnectionPool>> {
        self.inner.pool.read().clone()
    }

    fn ensure_running(&self, operation: &str) -> DataResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(self.error(operation, "connection manager is shut down"));
        }
        Ok(())
    }

    fn error(&self, operation: &str, message: impl Into<String>) -> DataError {
        DataError::connection(self.inner.config.database_kind(), operation, message)
            .with_retries(self.retry_count())
    }
}

impl ManagerInner {
    /// Open a fresh pool and verify it answers.
    async fn establish(&self) -> DataResult<Arc<ConnectionPool>> {
        let pool = Arc::new(ConnectionPool::new(&self.config, self.connector.clone()));
        let result = pool.check().await;
        self.metrics.lock().record_connection_attempt(result.is_ok());

        match result {
            Ok(_) => Ok(pool),
            Err(e) => {
                pool.dispose().await;
                Err(e)
            }
        }
    }

    /// Make `pool` current and mark the manager connected.
    ///
    /// Returns `false` and disposes `pool` once shutdown has begun.
    async fn install(&self, pool: Arc<ConnectionPool>) -> bool {
        let replaced = {
            let mut state = self.state.lock();
            if self.shutting_down.load(Ordering::SeqCst) {
                None
            } else {
                let previous = self.pool.write().replace(pool.clone());
                transition(&mut state, ConnectionState::Connected);
                Some(previous)
            }
        };

        match replaced {
            Some(previous) => {
                if let Some(previous) = previous {
                    previous.dispose().await;
                }
                true
            }
            None => {
                pool.dispose().await;
                false
            }
        }
    }

    /// After shutdown has begun only `Disconnected` is accepted.
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if self.shutting_down.load(Ordering::SeqCst) && next != ConnectionState::Disconnected {
            return;
        }
        transition(&mut state, next);
    }

    fn record_error(&self, error: &DataError) {
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Sleep for `delay` unless shutdown starts first. Returns `false` on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState) {
    let previous = std::mem::replace(state, next);
    if previous != next {
        info!(from = %previous, to = %next, "Connection state changed");
    }
}
