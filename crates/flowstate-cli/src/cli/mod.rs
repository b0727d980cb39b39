//! CLI command definitions for the `flowstate` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Run and check state machine definitions.
#[derive(Parser)]
#[command(name = "flowstate", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress the execution trace; only the result is printed.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for the full trace and info logs, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log records as JSON lines on stderr.
    #[arg(long, global = true, env = "FLOWSTATE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a definition file without running it.
    Validate {
        /// Path to the machine definition (JSON).
        file: PathBuf,
    },

    /// Execute a definition with the built-in demo handlers.
    Run(RunArgs),

    /// List the built-in handlers available to `Resource`.
    Handlers,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Path to the machine definition (JSON).
    pub file: PathBuf,

    /// Execution input as inline JSON.
    #[arg(long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read the execution input from a JSON file.
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Engine config file (defaults to ./flowstate.toml when present).
    #[arg(long, env = "FLOWSTATE_CONFIG")]
    pub config: Option<PathBuf>,
}
