//! Command-line interface for hive-forge.
//!
//! Provides the service runner plus trigger, health, metrics, status and
//! configuration-check commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
