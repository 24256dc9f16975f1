//! Process-wide data-access context.
//!
//! Built once at startup and passed (cloned) to whatever needs storage.

use tracing::{error, info};

use super::cache::CacheManager;
use super::db::ConnectionManager;
use super::unit_of_work::UnitOfWorkFactory;
use crate::config::{Settings, UnitOfWorkConfig};
use crate::errors::DataResult;

/// Connection manager, cache manager and unit-of-work factory.
#[derive(Clone)]
pub struct DataContext {
    pub connections: ConnectionManager,
    pub cache: CacheManager,
    pub units: UnitOfWorkFactory,
}

impl DataContext {
    /// Connect the database and the cache described by `settings`.
    ///
    /// If the cache cannot be set up the database connections are shut down
    /// again before the error is returned.
    pub async fn initialize(settings: &Settings) -> DataResult<Self> {
        let connections = ConnectionManager::new(settings.connection.clone())?;
        connections.initialize().await?;

        let cache = match CacheManager::connect(settings.cache.clone()).await {
            Ok(cache) => cache,
            Err(e) => {
                error!("Cache setup failed: {}", e);
                connections.shutdown().await;
                return Err(e);
            }
        };

        let context = Self::from_parts(connections, cache, settings.unit_of_work.clone());
        info!(
            database = context.connections.config().database_kind(),
            cache = context.cache.backend_name(),
            "Data context initialized"
        );
        Ok(context)
    }

    /// Assemble a context from managers that are already set up.
    pub fn from_parts(
        connections: ConnectionManager,
        cache: CacheManager,
        unit_of_work: UnitOfWorkConfig,
    ) -> Self {
        let units = UnitOfWorkFactory::new(connections.clone(), cache.clone(), unit_of_work);
        Self {
            connections,
            cache,
            units,
        }
    }

    /// Stop background tasks, close sessions and release the pool.
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
        self.connections.shutdown().await;
        info!("Data context shut down");
    }
}
