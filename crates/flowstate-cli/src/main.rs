//! flowstate command-line entry point.
//!
//! Binary name: `flowstate`
//!
//! Parses CLI arguments, sets up tracing, then dispatches to the command
//! handler. A failed execution or an invalid definition exits non-zero.

mod cli;
mod handlers;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use console::style;

use cli::run::RunOptions;
use cli::{Cli, Commands};
use flowstate_types::ExecutionStatus;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    flowstate_observe::tracing_setup::init_tracing(cli.log_json, Some(level))
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    match cli.command {
        Commands::Validate { file } => {
            let valid = cli::validate::validate(&file, cli.json).await?;
            Ok(if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }

        Commands::Run(args) => {
            let options = RunOptions {
                json: cli.json,
                quiet: cli.quiet,
                verbose: cli.verbose > 0,
            };
            let status = cli::run::run(args, options).await?;
            Ok(match status {
                ExecutionStatus::Succeeded => ExitCode::SUCCESS,
                ExecutionStatus::Failed => ExitCode::FAILURE,
            })
        }

        Commands::Handlers => {
            if cli.json {
                let list: Vec<_> = handlers::describe()
                    .into_iter()
                    .map(|(name, about)| serde_json::json!({ "name": name, "description": about }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&list)?);
            } else {
                for (name, about) in handlers::describe() {
                    println!("  {:<10} {}", style(name).cyan(), about);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "flowstate", &mut std::io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}
