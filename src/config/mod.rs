//! Data-access configuration module
//!
//! Connection, cache and unit-of-work settings plus their defaults.

mod constants;
mod settings;

pub use constants::*;
pub use settings::{
    CacheBackendKind, CacheConfig, ConnectionConfig, SerializeMethod, Settings, UnitOfWorkConfig,
};
