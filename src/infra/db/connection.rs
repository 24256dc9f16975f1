//! Storage boundary: one physical connection and the factory that opens it.
//!
//! The pool, the session guard and the unit of work only talk to these traits,
//! so the concrete engine can be swapped (or faked in tests).

use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, FromQueryResult, JsonValue, Statement,
    TransactionTrait,
};

use crate::config::{ConnectionConfig, HEALTH_CHECK_QUERY};

#[cfg(any(test, feature = "test-utils"))]
use mockall::automock;

/// A single connection to the backing store.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait StorageConnection: Send + Sync {
    /// Lightweight liveness check.
    async fn ping(&mut self) -> Result<(), DbErr>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, statement: Statement) -> Result<u64, DbErr>;

    /// Run a query, returning each row as a JSON object.
    async fn query(&mut self, statement: Statement) -> Result<Vec<JsonValue>, DbErr>;

    async fn begin(&mut self) -> Result<(), DbErr>;

    async fn commit(&mut self) -> Result<(), DbErr>;

    async fn rollback(&mut self) -> Result<(), DbErr>;

    /// Whether a transaction is currently open on this connection.
    fn in_transaction(&self) -> bool;

    /// Close the connection. Further calls must fail.
    async fn close(&mut self) -> Result<(), DbErr>;
}

/// Opens new connections for the pool.
#[cfg_attr(any(test, feature = "test-utils"), automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StorageConnection>, DbErr>;
}

// =============================================================================
// Savepoint statements
// =============================================================================

pub(crate) fn savepoint_statement(backend: DbBackend, name: &str) -> Statement {
    Statement::from_string(backend, format!("SAVEPOINT {}", name))
}

pub(crate) fn rollback_to_savepoint_statement(backend: DbBackend, name: &str) -> Statement {
    Statement::from_string(backend, format!("ROLLBACK TO SAVEPOINT {}", name))
}

pub(crate) fn release_savepoint_statement(backend: DbBackend, name: &str) -> Statement {
    Statement::from_string(backend, format!("RELEASE SAVEPOINT {}", name))
}

pub(crate) fn health_check_statement(backend: DbBackend) -> Statement {
    Statement::from_string(backend, HEALTH_CHECK_QUERY.to_string())
}

// =============================================================================
// SeaORM implementation
// =============================================================================

/// Opens single-connection SeaORM handles, one per pool slot.
pub struct SeaOrmConnector {
    url: String,
    connect_timeout: Duration,
}

impl SeaOrmConnector {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            url: config.database_url.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl Connector for SeaOrmConnector {
    async fn connect(&self) -> Result<Box<dyn StorageConnection>, DbErr> {
        let mut options = ConnectOptions::new(self.url.clone());
        options
            .max_connections(1)
            .min_connections(1)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.connect_timeout)
            .sqlx_logging(false);

        let db = SeaDatabase::connect(options).await?;
        Ok(Box::new(SeaOrmConnection {
            db: Some(db),
            txn: None,
        }))
    }
}

/// One SeaORM connection with an optional open transaction.
pub struct SeaOrmConnection {
    db: Option<DatabaseConnection>,
    txn: Option<DatabaseTransaction>,
}

impl SeaOrmConnection {
    fn db(&self) -> Result<&DatabaseConnection, DbErr> {
        self.db
            .as_ref()
            .ok_or_else(|| DbErr::Custom("connection is closed".to_string()))
    }
}

#[async_trait]
impl StorageConnection for SeaOrmConnection {
    async fn ping(&mut self) -> Result<(), DbErr> {
        let db = self.db()?;
        db.execute(health_check_statement(db.get_database_backend()))
            .await?;
        Ok(())
    }

    async fn execute(&mut self, statement: Statement) -> Result<u64, DbErr> {
        let result = match &self.txn {
            Some(txn) => txn.execute(statement).await?,
            None => self.db()?.execute(statement).await?,
        };
        Ok(result.rows_affected())
    }

    async fn query(&mut self, statement: Statement) -> Result<Vec<JsonValue>, DbErr> {
        match &self.txn {
            Some(txn) => JsonValue::find_by_statement(statement).all(txn).await,
            None => JsonValue::find_by_statement(statement).all(self.db()?).await,
        }
    }

    async fn begin(&mut self) -> Result<(), DbErr> {
        if self.txn.is_some() {
            return Err(DbErr::Custom("transaction already open".to_string()));
        }
        let txn = self.db()?.begin().await?;
        self.txn = Some(txn);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbErr> {
        match self.txn.take() {
            Some(txn) => txn.commit().await,
            None => Err(DbErr::Custom("no open transaction".to_string())),
        }
    }

    async fn rollback(&mut self) -> Result<(), DbErr> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await,
            None => Ok(()),
        }
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    async fn close(&mut self) -> Result<(), DbErr> {
        if let Some(txn) = self.txn.take() {
            if let Err(e) = txn.rollback().await {
                tracing::warn!("Rollback while closing connection failed: {}", e);
            }
        }
        match self.db.take() {
            Some(db) => db.close().await,
            None => Ok(()),
        }
    }
}
