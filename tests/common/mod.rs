//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{DbErr, JsonValue, RuntimeErr, Statement};

use persistence_kit::config::{CacheConfig, ConnectionConfig};
use persistence_kit::infra::cache::MemoryCacheBackend;
use persistence_kit::infra::db::{Connector, StorageConnection};
use persistence_kit::infra::{CacheManager, ConnectionManager};

/// What every stub connection has seen and will answer.
#[derive(Default)]
pub struct Journal {
    statements: Mutex<Vec<String>>,
    rows: Mutex<VecDeque<Vec<JsonValue>>>,
    affected: Mutex<VecDeque<u64>>,
    down: AtomicBool,
    failing_commits: AtomicUsize,
    deadlocks: AtomicUsize,
    connect_delay_ms: AtomicU64,
    open: AtomicUsize,
    peak: AtomicUsize,
}

/// Hand-written stand-in for a database server.
#[derive(Clone, Default)]
pub struct StubConnector {
    journal: Arc<Journal>,
}

impl StubConnector {
    pub fn set_down(&self, down: bool) {
        self.journal.down.store(down, Ordering::SeqCst);
    }

    /// Slow down every connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.journal
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.journal.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` statements fail with a deadlock.
    pub fn deadlock_next(&self, count: usize) {
        self.journal.deadlocks.store(count, Ordering::SeqCst);
    }

    pub fn answer_rows(&self, rows: Vec<JsonValue>) {
        self.journal.rows.lock().push_back(rows);
    }

    pub fn answer_affected(&self, count: u64) {
        self.journal.affected.lock().push_back(count);
    }

    pub fn statements(&self) -> Vec<String> {
        self.journal.statements.lock().clone()
    }

    pub fn count(&self, sql: &str) -> usize {
        self.statements().iter().filter(|s| s.as_str() == sql).count()
    }

    pub fn open(&self) -> usize {
        self.journal.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.journal.peak.load(Ordering::SeqCst)
    }
}

fn unreachable_server() -> DbErr {
    DbErr::Conn(RuntimeErr::Internal("server unreachable".to_string()))
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self) -> Result<Box<dyn StorageConnection>, DbErr> {
        let delay = self.journal.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.journal.down.load(Ordering::SeqCst) {
            return Err(unreachable_server());
        }
        let open = self.journal.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal.peak.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(StubConnection {
            journal: self.journal.clone(),
            in_transaction: false,
            closed: false,
        }))
    }
}

struct StubConnection {
    journal: Arc<Journal>,
    in_transaction: bool,
    closed: bool,
}

impl StubConnection {
    fn record(&self, sql: &str) -> Result<(), DbErr> {
        if self.closed {
            return Err(DbErr::Custom("connection closed".to_string()));
        }
        self.journal.statements.lock().push(sql.to_string());
        if take(&self.journal.deadlocks) {
            return Err(DbErr::Exec(RuntimeErr::Internal(
                "deadlock detected".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageConnection for StubConnection {
    async fn ping(&mut self) -> Result<(), DbErr> {
        if self.closed || self.journal.down.load(Ordering::SeqCst) {
            return Err(unreachable_server());
        }
        Ok(())
    }

    async fn execute(&mut self, statement: Statement) -> Result<u64, DbErr> {
        self.record(&statement.sql)?;
        Ok(self.journal.affected.lock().pop_front().unwrap_or(1))
    }

    async fn query(&mut self, statement: Statement) -> Result<Vec<JsonValue>, DbErr> {
        self.record(&statement.sql)?;
        Ok(self.journal.rows.lock().pop_front().unwrap_or_default())
    }

    async fn begin(&mut self) -> Result<(), DbErr> {
        self.journal.statements.lock().push("BEGIN".to_string());
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbErr> {
        if take(&self.journal.failing_commits) {
            return Err(DbErr::Exec(RuntimeErr::Internal(
                "could not commit".to_string(),
            )));
        }
        self.journal.statements.lock().push("COMMIT".to_string());
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbErr> {
        self.journal.statements.lock().push("ROLLBACK".to_string());
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(&mut self) -> Result<(), DbErr> {
        if !self.closed {
            self.closed = true;
            self.journal.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for StubConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.journal.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig::new("postgres://app@localhost/app")
        .with_pool_size(2, 1)
        .with_retries(3, Duration::from_millis(100))
}

/// Connection manager over `connector`, already initialized.
pub async fn connect(connector: &StubConnector, config: ConnectionConfig) -> ConnectionManager {
    let manager = ConnectionManager::with_connector(config, Arc::new(connector.clone()))
        .expect("valid config");
    manager.initialize().await.expect("initialized");
    manager
}

pub fn memory_cache(max_size: usize) -> CacheManager {
    let config = CacheConfig::memory()
        .with_max_memory_size(max_size)
        .with_default_ttl(Duration::from_secs(300));
    CacheManager::with_backend(config, Arc::new(MemoryCacheBackend::new(max_size, true)))
}
