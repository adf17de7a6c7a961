//! CLI module for aerolog
//!
//! Provides command-line interface for:
//! - inspect: list the index, the newest file and the commit log
//! - dump: print the records of one file
//! - recover: resolve a crashed log and print the committed xids
//! - purge: crash-safe deletion of old files
//! - rotate: start a new active file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{dump, inspect, purge, recover, rotate, run, run_command};
pub use errors::{CliError, CliErrorCode, CliResult};
