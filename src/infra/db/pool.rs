//! Bounded connection pool with overflow, recycling and pre-ping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sea_orm::DbBackend;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::{Connector, StorageConnection};
use super::metrics::PoolStatus;
use crate::config::ConnectionConfig;
use crate::errors::{DataError, DataResult};

/// A physical connection owned by the pool.
///
/// Counts towards the pool's open connections until it is dropped.
pub struct PooledConnection {
    id: Uuid,
    created_at: Instant,
    broken: bool,
    inner: Box<dyn StorageConnection>,
    open: Arc<AtomicUsize>,
}

impl PooledConnection {
    fn new(inner: Box<dyn StorageConnection>, open: Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            broken: false,
            inner,
            open,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&mut self) -> &mut dyn StorageConnection {
        self.inner.as_mut()
    }

    /// Flag the connection so the pool closes it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A connection lent out by [`ConnectionPool::acquire`] together with its slot.
pub struct Checkout {
    pub connection: PooledConnection,
    pub permit: OwnedSemaphorePermit,
}

/// Pool of at most `pool_size + max_overflow` connections.
///
/// Up to `pool_size` idle connections are kept for reuse; overflow
/// connections are closed when they come back.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    database: &'static str,
    backend: DbBackend,
    pool_size: usize,
    max_overflow: usize,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    recycle_after: Duration,
    pre_ping: bool,
    idle: Mutex<VecDeque<PooledConnection>>,
    permits: Arc<Semaphore>,
    open: Arc<AtomicUsize>,
    in_use: AtomicUsize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: &ConnectionConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            database: config.database_kind(),
            backend: config.backend(),
            pool_size: config.pool_size as usize,
            max_overflow: config.max_overflow as usize,
            acquire_timeout: config.pool_timeout(),
            connect_timeout: config.connect_timeout(),
            recycle_after: config.pool_recycle(),
            pre_ping: config.pool_pre_ping,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(config.max_connections())),
            open: Arc::new(AtomicUsize::new(0)),
            in_use: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn database(&self) -> &'static str {
        self.database
    }

    pub fn backend(&self) -> DbBackend {
        self.backend
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Borrow a connection, waiting up to the pool timeout for a free slot.
    pub async fn acquire(&self) -> DataResult<Checkout> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }

        let permit = match timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.disposed_error()),
            Err(_) => {
                return Err(DataError::connection(
                    self.database,
                    "acquire",
                    format!(
                        "pool exhausted: no connection available within {:?}",
                        self.acquire_timeout
                    ),
                ))
            }
        };

        self.lend(permit).await
    }

    /// Ping one connection if a slot is free and return the round-trip time.
    ///
    /// Never waits for a slot: `Ok(None)` means every connection is lent out.
    pub async fn check(&self) -> DataResult<Option<Duration>> {
        if self.is_disposed() {
            return Err(self.disposed_error());
        }
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(None),
            Err(TryAcquireError::Closed) => return Err(self.disposed_error()),
        };

        let Checkout {
            mut connection,
            permit,
        } = self.lend(permit).await?;

        let started = Instant::now();
        let result = match timeout(self.connect_timeout, connection.inner.ping()).await {
            Ok(Ok(())) => Ok(Some(started.elapsed())),
            Ok(Err(e)) => Err(DataError::connection(self.database, "ping", e.to_string())),
            Err(_) => Err(DataError::connection(
                self.database,
                "ping",
                format!("no response within {:?}", self.connect_timeout),
            )),
        };
        if result.is_err() {
            connection.mark_broken();
        }

        self.release(connection).await;
        drop(permit);
        result
    }

    /// Hand out an idle connection or open a new one for an acquired slot.
    async fn lend(&self, permit: OwnedSemaphorePermit) -> DataResult<Checkout> {
        while let Some(mut candidate) = self.pop_idle() {
            if candidate.age() >= self.recycle_after {
                debug!(connection_id = %candidate.id, "Recycling aged connection");
                self.discard(candidate).await;
                continue;
            }
            if self.pre_ping {
                let ping = timeout(self.connect_timeout, candidate.inner.ping()).await;
                if !matches!(ping, Ok(Ok(()))) {
                    debug!(connection_id = %candidate.id, "Discarding connection that failed pre-ping");
                    self.discard(candidate).await;
                    continue;
                }
            }
            self.in_use.fetch_add(1, Ordering::SeqCst);
            return Ok(Checkout {
                connection: candidate,
                permit,
            });
        }

        let connection = self.open_connection().await?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(Checkout { connection, permit })
    }

    /// Return a connection. Open transactions are rolled back first.
    pub async fn release(&self, mut connection: PooledConnection) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);

        if !connection.broken && connection.inner.in_transaction() {
            warn!(connection_id = %connection.id, "Connection returned with an open transaction, rolling back");
            if let Err(e) = connection.inner.rollback().await {
                warn!(connection_id = %connection.id, "Rollback on release failed: {}", e);
                connection.broken = true;
            }
        }

        let reusable =
            !connection.broken && !self.is_disposed() && connection.age() < self.recycle_after;
        let rejected = {
            let mut idle = self.idle.lock();
            if reusable && idle.len() < self.pool_size {
                idle.push_back(connection);
                None
            } else {
                Some(connection)
            }
        };

        if let Some(connection) = rejected {
            self.discard(connection).await;
        }
    }

    /// Close a lent-out connection without returning it.
    pub async fn retire(&self, connection: PooledConnection) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.discard(connection).await;
    }

    /// Close idle connections and refuse further checkouts.
    ///
    /// Connections still lent out are closed as they are returned.
    pub async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        let drained: Vec<PooledConnection> = self.idle.lock().drain(..).collect();
        let count = drained.len();
        for connection in drained {
            self.discard(connection).await;
        }
        debug!(closed = count, "Connection pool disposed");
    }

    pub fn status(&self) -> PoolStatus {
        let total_open = self.open.load(Ordering::SeqCst);
        PoolStatus {
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
            in_use: self.in_use.load(Ordering::SeqCst),
            idle: self.idle.lock().len(),
            overflow: total_open.saturating_sub(self.pool_size),
            total_open,
        }
    }

    fn pop_idle(&self) -> Option<PooledConnection> {
        self.idle.lock().pop_front()
    }

    async fn open_connection(&self) -> DataResult<PooledConnection> {
        match timeout(self.connect_timeout, self.connector.connect()).await {
            Ok(Ok(inner)) => {
                let connection = PooledConnection::new(inner, self.open.clone());
                debug!(connection_id = %connection.id, "Opened new connection");
                Ok(connection)
            }
            Ok(Err(e)) => Err(DataError::connection(self.database, "connect", e.to_string())),
            Err(_) => Err(DataError::connection(
                self.database,
                "connect",
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        }
    }

    async fn discard(&self, mut connection: PooledConnection) {
        if let Err(e) = connection.inner.close().await {
            debug!(connection_id = %connection.id, "Error closing connection: {}", e);
        }
    }

    fn disposed_error(&self) -> DataError {
        DataError::connection(self.database, "acquire", "connection pool is disposed")
    }
}
