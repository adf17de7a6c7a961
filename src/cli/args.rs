//! CLI argument definitions using clap
//!
//! Commands:
//! - aerolog inspect --config <path>
//! - aerolog dump <file>
//! - aerolog recover --config <path>
//! - aerolog purge --config <path> (--to <name> | --before <rfc3339>)
//! - aerolog rotate --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerolog - operator tool for commit logs and log files
#[derive(Parser, Debug)]
#[command(name = "aerolog")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the index, the newest file and the commit log without changing them
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolog.json")]
        config: PathBuf,
    },

    /// Print every record of one log file as a JSON line
    Dump {
        /// Log file to read
        file: PathBuf,
    },

    /// Report a crashed commit log and the xids it holds as committed
    Recover {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolog.json")]
        config: PathBuf,
    },

    /// Delete old log files
    Purge {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolog.json")]
        config: PathBuf,

        /// Delete files listed before this one
        #[arg(long, conflicts_with = "before", required_unless_present = "before")]
        to: Option<String>,

        /// Delete files last modified before this RFC 3339 time
        #[arg(long)]
        before: Option<String>,
    },

    /// Close the active file and start the next one
    Rotate {
        /// Path to configuration file
        #[arg(long, default_value = "./aerolog.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
