//! Persistence Kit - A resilient data-access layer
//!
//! This crate provides pooled database connections with health monitoring
//! and automatic reconnection, a cache with memory and Redis backends, and
//! units of work that tie transactions, repositories and cache invalidation
//! together.
//!
//! # Modules
//!
//! - **cli**: Command-line interface
//! - **commands**: CLI command implementations
//! - **config**: Connection, cache and unit-of-work configuration
//! - **infra**: Connection manager, cache, repositories, units of work
//! - **errors**: Centralized error handling
//!
//! # Usage
//!
//! ```no_run
//! use persistence_kit::{config::Settings, DataContext};
//!
//! # async fn run() -> persistence_kit::DataResult<()> {
//! let settings = Settings::from_env()?;
//! let context = DataContext::initialize(&settings).await?;
//!
//! let rows = context
//!     .units
//!     .transaction(|uow| {
//!         Box::pin(async move { uow.execute("UPDATE jobs SET done = true", vec![]).await })
//!     })
//!     .await?;
//!
//! tracing::info!(rows, "Jobs marked done");
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod errors;
pub mod infra;

// Re-export commonly used types at crate root
pub use config::Settings;
pub use errors::{DataError, DataResult};
pub use infra::{CacheManager, ConnectionManager, DataContext, UnitOfWork, UnitOfWorkFactory};
