//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Runwarden - drives pipeline runs to completion
#[derive(Parser, Debug)]
#[command(name = "runwarden")]
#[command(version)]
#[command(about = "Event-driven controller that drives pipeline runs to completion")]
#[command(
    long_about = "Runwarden watches pipeline runs and their steps, reconciles each run toward a terminal phase, and times out runs that stay Running too long, including across restarts."
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of reconcile workers per controller
    #[arg(short, long, global = true)]
    pub workers: Option<usize>,

    /// Only reconcile objects in this namespace
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    /// Run timeout in seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Log filter used when RUST_LOG is unset (e.g. "info", "runwarden=debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the controllers over an in-memory store seeded with demo runs
    Run {
        /// Pipeline runs to create at startup
        #[arg(long, default_value_t = 3)]
        runs: usize,

        /// Steps per pipeline run
        #[arg(long, default_value_t = 3)]
        steps: u32,

        /// Simulated duration of each step in milliseconds
        #[arg(long, default_value_t = 200)]
        step_ms: u64,

        /// Stop once every seeded run is terminal
        #[arg(long, default_value_t = false)]
        exit_when_done: bool,
    },

    /// Print the effective configuration and exit
    Config,
}
