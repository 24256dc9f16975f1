//! CLI module - Operator commands for the data-access layer.
//!
//! Provides commands for:
//! - `health` - Ping the database and print the health report
//! - `monitor` - Watch pool and connection state over time
//! - `cache-stats` - Exercise the configured cache and print its statistics

pub mod args;

pub use args::{Cli, Commands};
