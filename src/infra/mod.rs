//! Infrastructure layer - Storage and caching
//!
//! This module handles all external system concerns:
//! - Pooled database connections with health monitoring
//! - Caching with memory and Redis backends
//! - Repositories over a shared session
//! - Unit of Work for transaction management

pub mod cache;
pub mod context;
pub mod db;
pub mod repositories;
pub mod unit_of_work;

pub use cache::{cached, CacheBackend, CacheManager, CacheStats};
pub use context::DataContext;
pub use db::{ConnectionManager, ConnectionState, HealthStatus, PoolStatus, Session, SessionHandle};
pub use repositories::{
    CrudRepository, DeleteRepository, Entity, EntityRepository, FieldPatch, ReadRepository,
    Repository, RepositoryContext, WriteRepository,
};
pub use unit_of_work::{HookPoint, Savepoint, UnitOfWork, UnitOfWorkFactory, UnitOfWorkStatus};

#[cfg(any(test, feature = "test-utils"))]
pub use cache::MockCacheBackend;
#[cfg(any(test, feature = "test-utils"))]
pub use db::{MockConnector, MockStorageConnection};
