//! In-memory stand-in for the storage engine.
//!
//! Connections share one [`FakeState`], so a test can take the "database"
//! down, inject commit failures and inspect the statements that were sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sea_orm::{DbErr, JsonValue, RuntimeErr, Statement};

use super::connection::{Connector, StorageConnection};

#[derive(Default)]
pub struct FakeState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    connect_down: AtomicBool,
    connect_delay_ms: AtomicU64,
    ping_delay_ms: AtomicU64,
    failing_pings: AtomicUsize,
    ping_down: AtomicBool,
    failing_commits: AtomicUsize,
    statements: Mutex<Vec<String>>,
    query_results: Mutex<VecDeque<Vec<JsonValue>>>,
    execute_results: Mutex<VecDeque<u64>>,
}

/// Connector whose connections all report to the same [`FakeState`].
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse new connections (and fail pings) while `down` is set.
    pub fn set_down(&self, down: bool) {
        self.state.connect_down.store(down, Ordering::SeqCst);
        self.state.ping_down.store(down, Ordering::SeqCst);
    }

    /// Make every connect take `delay` before it answers.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every ping take `delay` before it answers.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.state
            .ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail the next `count` pings on any connection.
    pub fn fail_pings(&self, count: usize) {
        self.state.failing_pings.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` commits on any connection.
    pub fn fail_commits(&self, count: usize) {
        self.state.failing_commits.store(count, Ordering::SeqCst);
    }

    pub fn push_query_result(&self, rows: Vec<JsonValue>) {
        self.state.query_results.lock().push_back(rows);
    }

    pub fn push_execute_result(&self, rows_affected: u64) {
        self.state.execute_results.lock().push_back(rows_affected);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections seen.
    pub fn max_open(&self) -> usize {
        self.state.max_open.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.statements.lock().clone()
    }

    pub fn count_statements(&self, sql: &str) -> usize {
        self.state
            .statements
            .lock()
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn StorageConnection>, DbErr> {
        delay(&self.state.connect_delay_ms).await;
        if self.state.connect_down.load(Ordering::SeqCst) {
            return Err(refused());
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let open = self.state.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            state: self.state.clone(),
            in_transaction: false,
            closed: false,
        }))
    }
}

pub struct FakeConnection {
    state: Arc<FakeState>,
    in_transaction: bool,
    closed: bool,
}

impl FakeConnection {
    fn check_open(&self) -> Result<(), DbErr> {
        if self.closed {
            return Err(DbErr::Custom("connection is closed".to_string()));
        }
        Ok(())
    }

    fn log(&self, sql: impl Into<String>) {
        self.state.statements.lock().push(sql.into());
    }
}

fn refused() -> DbErr {
    DbErr::Conn(RuntimeErr::Internal("connection refused".to_string()))
}

async fn delay(millis: &AtomicU64) {
    let millis = millis.load(Ordering::SeqCst);
    if millis > 0 {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl StorageConnection for FakeConnection {
    async fn ping(&mut self) -> Result<(), DbErr> {
        self.check_open()?;
        delay(&self.state.ping_delay_ms).await;
        if self.state.ping_down.load(Ordering::SeqCst) || take_one(&self.state.failing_pings) {
            return Err(refused());
        }
        Ok(())
    }

    async fn execute(&mut self, statement: Statement) -> Result<u64, DbErr> {
        self.check_open()?;
        self.log(statement.sql);
        Ok(self.state.execute_results.lock().pop_front().unwrap_or(1))
    }

    async fn query(&mut self, statement: Statement) -> Result<Vec<JsonValue>, DbErr> {
        self.check_open()?;
        self.log(statement.sql);
        Ok(self.state.query_results.lock().pop_front().unwrap_or_default())
    }

    async fn begin(&mut self) -> Result<(), DbErr> {
        self.check_open()?;
        self.log("BEGIN");
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbErr> {
        self.check_open()?;
        if take_one(&self.state.failing_commits) {
            self.log("COMMIT FAILED");
            return Err(DbErr::Exec(RuntimeErr::Internal(
                "commit rejected by server".to_string(),
            )));
        }
        self.log("COMMIT");
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbErr> {
        self.check_open()?;
        self.log("ROLLBACK");
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn close(&mut self) -> Result<(), DbErr> {
        if !self.closed {
            self.closed = true;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
            self.state.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// A dropped socket is gone for the server too.
impl Drop for FakeConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.state.open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
