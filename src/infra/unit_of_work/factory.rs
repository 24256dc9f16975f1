//! Factory for units of work bound to the shared connection and cache managers.

use futures::future::BoxFuture;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{UnitOfWork, UnitOfWorkStatus};
use crate::config::UnitOfWorkConfig;
use crate::errors::{DataError, DataResult};
use crate::infra::cache::CacheManager;
use crate::infra::db::ConnectionManager;

/// Creates units of work and runs closures in managed transactions.
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    connections: ConnectionManager,
    cache: CacheManager,
    config: UnitOfWorkConfig,
}

impl UnitOfWorkFactory {
    pub fn new(connections: ConnectionManager, cache: CacheManager, config: UnitOfWorkConfig) -> Self {
        Self {
            connections,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    /// Borrow a session and wrap it in an inactive unit of work.
    pub async fn create(&self, config: Option<UnitOfWorkConfig>) -> DataResult<UnitOfWork> {
        let session = self.connections.get_session().await?;
        let config = config.unwrap_or_else(|| self.config.clone());
        let uow = UnitOfWork::new(session, self.cache.clone(), config);
        debug!(unit_of_work = %uow.id(), "Unit of work created");
        Ok(uow)
    }

    /// Begin, run `f`, then commit on `Ok` or roll back on `Err`.
    ///
    /// The whole scope is bounded by `transaction_timeout`. Without
    /// `auto_commit`, a transaction that `f` leaves open is rolled back.
    /// The session is returned to the pool on every path.
    pub async fn transaction<T, F>(&self, f: F) -> DataResult<T>
    where
        F: for<'a> FnOnce(&'a mut UnitOfWork) -> BoxFuture<'a, DataResult<T>>,
    {
        let mut uow = self.create(None).await?;
        let result = self.run_scoped(&mut uow, f).await;
        uow.close().await;
        result
    }

    async fn run_scoped<T, F>(&self, uow: &mut UnitOfWork, f: F) -> DataResult<T>
    where
        F: for<'a> FnOnce(&'a mut UnitOfWork) -> BoxFuture<'a, DataResult<T>>,
    {
        uow.begin().await?;
        let limit = self.config.transaction_timeout();

        match timeout(limit, f(&mut *uow)).await {
            Ok(Ok(value)) => {
                if uow.status() == UnitOfWorkStatus::Active {
                    if self.config.auto_commit {
                        uow.commit().await?;
                    } else {
                        warn!(unit_of_work = %uow.id(), "Transaction left open without auto_commit, rolling back");
                        uow.rollback().await?;
                    }
                }
                Ok(value)
            }
            Ok(Err(e)) => {
                discard(uow).await;
                Err(e)
            }
            Err(_) => {
                discard(uow).await;
                Err(DataError::transaction(format!(
                    "transaction timed out after {:?}",
                    limit
                )))
            }
        }
    }

    /// Like [`transaction`](Self::transaction), retrying transient failures.
    ///
    /// Each attempt runs `op` and commits; a transient failure in either
    /// rolls back and starts over with exponential backoff.
    pub async fn execute_in_transaction<T, F>(&self, op: F) -> DataResult<T>
    where
        F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, DataResult<T>>,
    {
        let mut uow = self.create(None).await?;
        let limit = self.config.transaction_timeout();

        let result = match timeout(limit, uow.retry(op, true)).await {
            Ok(result) => result,
            Err(_) => {
                discard(&mut uow).await;
                Err(DataError::transaction(format!(
                    "transaction timed out after {:?}",
                    limit
                )))
            }
        };

        uow.close().await;
        result
    }
}

async fn discard(uow: &mut UnitOfWork) {
    if uow.is_active() {
        if let Err(e) = uow.rollback().await {
            warn!(unit_of_work = %uow.id(), "Rollback failed: {}", e);
        }
    }
}
