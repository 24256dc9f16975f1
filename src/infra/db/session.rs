//! Scoped sessions over pooled connections.
//!
//! A [`Session`] owns one checkout. Dropping it returns the connection to the
//! pool on a background task; [`Session::release`] does the same inline.
//! Cloned [`SessionHandle`]s stay valid until the session is released or
//! force-closed by shutdown, after which every call fails.

use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sea_orm::{DbBackend, DbErr, JsonValue, Statement, Value};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::{
    release_savepoint_statement, rollback_to_savepoint_statement, savepoint_statement,
};
use super::pool::{Checkout, ConnectionPool, PooledConnection};
use crate::errors::{DataError, DataResult};

pub(crate) struct SessionSlot {
    id: Uuid,
    opened_at: DateTime<Utc>,
    pool: Arc<ConnectionPool>,
    connection: Mutex<Option<PooledConnection>>,
}

impl SessionSlot {
    async fn return_to_pool(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            self.pool.release(connection).await;
        }
    }

    async fn force_close(&self) -> bool {
        let connection = self.connection.lock().await.take();
        match connection {
            Some(connection) => {
                self.pool.retire(connection).await;
                true
            }
            None => false,
        }
    }
}

/// Cloneable access to the connection held by a [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    slot: Arc<SessionSlot>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.slot.id
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.slot.opened_at
    }

    pub fn backend(&self) -> DbBackend {
        self.slot.pool.backend()
    }

    /// Build a statement in this session's SQL dialect.
    pub fn statement(&self, sql: &str, values: Vec<Value>) -> Statement {
        if values.is_empty() {
            Statement::from_string(self.backend(), sql.to_string())
        } else {
            Statement::from_sql_and_values(self.backend(), sql, values)
        }
    }

    pub async fn is_open(&self) -> bool {
        self.slot.connection.lock().await.is_some()
    }

    pub async fn ping(&self) -> DataResult<()> {
        let mut guard = self.slot.connection.lock().await;
        let connection = self.checked_out(&mut guard, "ping")?;
        let result = connection.connection().ping().await;
        settle(connection, result)
    }

    pub async fn execute(&self, statement: Statement) -> DataResult<u64> {
        let mut guard = self.slot.connection.lock().await;
        let connection = self.checked_out(&mut guard, "execute")?;
        let result = connection.connection().execute(statement).await;
        settle(connection, result)
    }

    pub async fn query(&self, statement: Statement) -> DataResult<Vec<JsonValue>> {
        let mut guard = self.slot.connection.lock().await;
        let connection = self.checked_out(&mut guard, "query")?;
        let result = connection.connection().query(statement).await;
        settle(connection, result)
    }

    pub async fn begin(&self) -> DataResult<()> {
        let mut guard = self.slot.connection.lock().await;
        let connection = self.checked_out(&mut guard, "begin")?;
        let result = connection.connection().begin().await;
        settle(connection, result)
    }

    pub async fn commit(&self) -> DataResult<()> {
        let mut guard = self.slot.connection.lock().await;
        let connection = self.checked_out(&mut guard, "commit")?;
        let result = connection.connection().commit().await;
        settle(connection, result)
    }

    pub async fn rollback(&self) -> DataResult<()> {
        let mut guard = self.slot.connection.lock().await;
        let connection = self.checked_out(&mut guard, "rollback")?;
        let result = connection.connection().rollback().await;
        settle(connection, result)
    }

    pub async fn in_transaction(&self) -> bool {
        self.slot
            .connection
            .lock()
            .await
            .as_mut()
            .is_some_and(|c| c.connection().in_transaction())
    }

    pub async fn savepoint(&self, name: &str) -> DataResult<()> {
        self.execute(savepoint_statement(self.backend(), name))
            .await
            .map(|_| ())
    }

    pub async fn rollback_to_savepoint(&self, name: &str) -> DataResult<()> {
        self.execute(rollback_to_savepoint_statement(self.backend(), name))
            .await
            .map(|_| ())
    }

    pub async fn release_savepoint(&self, name: &str) -> DataResult<()> {
        self.execute(release_savepoint_statement(self.backend(), name))
            .await
            .map(|_| ())
    }

    fn checked_out<'g>(
        &self,
        guard: &'g mut Option<PooledConnection>,
        operation: &str,
    ) -> DataResult<&'g mut PooledConnection> {
        guard.as_mut().ok_or_else(|| {
            DataError::connection(
                self.slot.pool.database(),
                operation,
                format!("session {} is closed", self.slot.id),
            )
        })
    }
}

/// Map a driver result, flagging the connection when the link itself failed.
fn settle<T>(connection: &mut PooledConnection, result: Result<T, DbErr>) -> DataResult<T> {
    result.map_err(|e| {
        if matches!(e, DbErr::Conn(_) | DbErr::ConnectionAcquire(_)) {
            connection.mark_broken();
        }
        DataError::Database(e)
    })
}

/// A borrowed connection, returned to the pool when released or dropped.
pub struct Session {
    handle: SessionHandle,
    permit: Option<OwnedSemaphorePermit>,
    coordinator: Arc<SessionCoordinator>,
    released: bool,
}

impl Session {
    pub(crate) fn open(
        checkout: Checkout,
        pool: Arc<ConnectionPool>,
        coordinator: Arc<SessionCoordinator>,
    ) -> Self {
        let Checkout { connection, permit } = checkout;
        let handle = SessionHandle {
            slot: Arc::new(SessionSlot {
                id: Uuid::new_v4(),
                opened_at: Utc::now(),
                pool,
                connection: Mutex::new(Some(connection)),
            }),
        };
        coordinator.register(handle.clone());
        debug!(session_id = %handle.id(), "Session opened");

        Self {
            handle,
            permit: Some(permit),
            coordinator,
            released: false,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Return the connection to the pool now.
    pub async fn release(mut self) {
        self.released = true;
        self.coordinator.deregister(self.handle.id());
        self.handle.slot.return_to_pool().await;
        self.permit.take();
        debug!(session_id = %self.handle.id(), "Session released");
    }
}

impl Deref for Session {
    type Target = SessionHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let handle = self.handle.clone();
        let coordinator = self.coordinator.clone();
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    coordinator.deregister(handle.id());
                    handle.slot.return_to_pool().await;
                    drop(permit);
                    debug!(session_id = %handle.id(), "Session released on drop");
                });
            }
            Err(_) => {
                coordinator.deregister(handle.id());
                warn!(session_id = %handle.id(), "Session dropped outside a runtime, connection not returned");
            }
        }
    }
}

/// Registry of live sessions so shutdown can close them.
#[derive(Default)]
pub struct SessionCoordinator {
    sessions: DashMap<Uuid, SessionHandle>,
}

impl SessionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, handle: SessionHandle) {
        self.sessions.insert(handle.id(), handle);
    }

    fn deregister(&self, id: Uuid) {
        self.sessions.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Force-close every live session. Returns how many held a connection.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.sessions.clear();

        let mut closed = 0;
        for handle in handles {
            if handle.slot.force_close().await {
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::infra::db::testing::FakeConnector;

    async fn open_session() -> (Session, Arc<ConnectionPool>, Arc<SessionCoordinator>, FakeConnector) {
        let connector = FakeConnector::new();
        let config = ConnectionConfig::new("postgres://localhost/test").with_pool_size(2, 0);
        let pool = Arc::new(ConnectionPool::new(&config, Arc::new(connector.clone())));
        let coordinator = Arc::new(SessionCoordinator::new());
        let checkout = pool.acquire().await.unwrap();
        let session = Session::open(checkout, pool.clone(), coordinator.clone());
        (session, pool, coordinator, connector)
    }

    #[tokio::test]
    async fn test_release_returns_connection() {
        let (session, pool, coordinator, _connector) = open_session().await;
        assert_eq!(coordinator.active_count(), 1);
        assert_eq!(pool.status().in_use, 1);

        session.release().await;

        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(pool.status().in_use, 0);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_drop_returns_connection() {
        let (session, pool, coordinator, _connector) = open_session().await;
        drop(session);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_handle_fails_after_release() {
        let (session, _pool, _coordinator, _connector) = open_session().await;
        let handle = session.handle();
        session.release().await;

        let err = handle.ping().await.err().unwrap();
        assert!(matches!(err, DataError::Connection { .. }));
        assert!(!handle.is_open().await);
    }

    #[tokio::test]
    async fn test_close_all_force_closes_sessions() {
        let (session, pool, coordinator, connector) = open_session().await;
        let handle = session.handle();

        assert_eq!(coordinator.close_all().await, 1);
        assert!(handle.execute(handle.statement("SELECT 1", vec![])).await.is_err());
        assert_eq!(connector.open_connections(), 0);

        session.release().await;
        assert_eq!(pool.status().in_use, 0);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_savepoint_statements() {
        let (session, _pool, _coordinator, connector) = open_session().await;
        session.begin().await.unwrap();
        session.savepoint("sp_1").await.unwrap();
        session.rollback_to_savepoint("sp_1").await.unwrap();
        session.release_savepoint("sp_1").await.unwrap();
        session.commit().await.unwrap();

        assert_eq!(
            connector.statements(),
            vec![
                "BEGIN",
                "SAVEPOINT sp_1",
                "ROLLBACK TO SAVEPOINT sp_1",
                "RELEASE SAVEPOINT sp_1",
                "COMMIT"
            ]
        );
        session.release().await;
    }
}
