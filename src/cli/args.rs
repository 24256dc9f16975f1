//! CLI argument definitions.
//!
//! Uses clap derive macros for type-safe argument parsing.

use clap::{Parser, Subcommand};

/// Persistence Kit - Connection, cache and transaction diagnostics
#[derive(Parser, Debug)]
#[command(name = "persistence-kit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect, ping the database and print the health report
    Health(HealthArgs),

    /// Print pool status periodically while the health loop runs
    Monitor(MonitorArgs),

    /// Run a short workload against the cache and print statistics
    CacheStats(CacheStatsArgs),
}

/// Arguments for the health command
#[derive(Parser, Debug)]
pub struct HealthArgs {
    /// Print compact JSON instead of pretty-printed
    #[arg(long)]
    pub compact: bool,
}

/// Arguments for the monitor command
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Stop after this many reports (runs until Ctrl-C when omitted)
    #[arg(short, long)]
    pub ticks: Option<u64>,

    /// Seconds between reports
    #[arg(short, long, default_value = "5")]
    pub interval: u64,
}

/// Arguments for the cache-stats command
#[derive(Parser, Debug)]
pub struct CacheStatsArgs {
    /// Number of keys to write and read back
    #[arg(short, long, default_value = "100")]
    pub samples: usize,
}
