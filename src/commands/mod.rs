//! Commands module - CLI command implementations.
//!
//! Each command is implemented in its own module for separation of concerns.

pub mod cache_stats;
pub mod health;
pub mod monitor;

use serde::Serialize;

use crate::errors::DataResult;

/// Print a value as JSON on stdout.
pub(crate) fn print_json<T: Serialize>(value: &T, compact: bool) -> DataResult<()> {
    let rendered = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", rendered);
    Ok(())
}
