//! `flowstate run`: execute a definition with the built-in handlers.
//!
//! The execution trace goes to stderr through the console reporter; the
//! final status and output go to stdout. Ctrl-C cancels the execution token,
//! so running handlers are abandoned and the run fails with
//! `States.Aborted`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use console::style;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use flowstate_core::config::{CONFIG_FILE_NAME, load_engine_config};
use flowstate_core::{ExecutionContext, execute};
use flowstate_observe::ConsoleReporter;
use flowstate_types::ExecutionStatus;

use crate::cli::RunArgs;
use crate::cli::validate::load_definition;
use crate::handlers;

/// Output switches taken from the global flags.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub json: bool,
    pub quiet: bool,
    pub verbose: bool,
}

pub async fn run(args: RunArgs, options: RunOptions) -> Result<ExecutionStatus> {
    let def = load_definition(&args.file).await?;
    let input = read_input(args.input.as_deref(), args.input_file.as_deref()).await?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
    let config = load_engine_config(&config_path).await;

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, aborting execution");
            ctrl_c.cancel();
        }
    });

    let mut builder = ExecutionContext::builder()
        .handlers(handlers::builtin())
        .abort_token(token)
        .config(config);
    if options.quiet {
        builder = builder.quiet(true);
    } else if !options.json {
        builder = builder.log_sink(Arc::new(ConsoleReporter::stderr(options.verbose)));
    }
    let ctx = builder.build();

    let outcome = execute(&def, &ctx, input)
        .await
        .with_context(|| format!("{} is not a valid definition", args.file.display()))?;
    let (status, output) = outcome.into_parts();
    print_result(status, &output, options.json)?;
    Ok(status)
}

/// Inline JSON wins over a file; neither means `{}`.
async fn read_input(inline: Option<&str>, file: Option<&Path>) -> Result<Value> {
    if let Some(text) = inline {
        return serde_json::from_str(text).context("--input is not valid JSON");
    }
    if let Some(path) = file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&text)
            .with_context(|| format!("{} is not valid JSON", path.display()));
    }
    Ok(Value::Object(serde_json::Map::new()))
}

fn print_result(status: ExecutionStatus, output: &Value, json: bool) -> Result<()> {
    if json {
        let report = serde_json::json!({ "status": status, "output": output });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let label = match status {
        ExecutionStatus::Succeeded => style(status.as_str()).green().bold(),
        ExecutionStatus::Failed => style(status.as_str()).red().bold(),
    };
    println!();
    println!("  {label}");
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_input_sources() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.json");
        tokio::fs::write(&path, r#"{"from":"file"}"#).await.unwrap();

        assert_eq!(read_input(None, None).await.unwrap(), json!({}));
        assert_eq!(
            read_input(Some(r#"[1,2]"#), None).await.unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            read_input(None, Some(&path)).await.unwrap(),
            json!({ "from": "file" })
        );
        assert!(read_input(Some("{"), None).await.is_err());
    }

    #[tokio::test]
    async fn test_run_reports_status() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("machine.json");
        tokio::fs::write(
            &file,
            r#"{
                "StartAt": "Check",
                "States": {
                    "Check": {
                        "Type": "Choice",
                        "Choices": [{ "Variable": "$.ok", "BooleanEquals": true, "Next": "Done" }],
                        "Default": "Broken"
                    },
                    "Done": { "Type": "Succeed" },
                    "Broken": { "Type": "Task", "Resource": "fail", "End": true }
                }
            }"#,
        )
        .await
        .unwrap();

        let options = RunOptions {
            json: true,
            quiet: true,
            verbose: false,
        };
        let args = |input: &str| RunArgs {
            file: file.clone(),
            input: Some(input.to_string()),
            input_file: None,
            config: Some(dir.path().join(CONFIG_FILE_NAME)),
        };

        let status = run(args(r#"{"ok":true}"#), options).await.unwrap();
        assert_eq!(status, ExecutionStatus::Succeeded);
        let status = run(args(r#"{"ok":false}"#), options).await.unwrap();
        assert_eq!(status, ExecutionStatus::Failed);
    }
}
