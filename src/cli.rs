//! CLI argument parsing for calltrack

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "calltrack")]
#[command(version)]
#[command(
    about = "Call tracking and breakdown metrics for intercepted host calls",
    long_about = None
)]
pub struct Cli {
    /// Enable debug tracing output (to stderr)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a scenario of intercepted calls and print the NDJSON payloads
    Replay {
        /// Scenario file (JSON)
        #[arg(value_name = "SCENARIO")]
        scenario: PathBuf,

        /// Agent configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Write NDJSON to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Load and validate an agent configuration file
    CheckConfig {
        /// Agent configuration file (TOML)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}
