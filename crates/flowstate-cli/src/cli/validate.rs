//! `flowstate validate`: parse and structurally check a definition file.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use flowstate_core::{parse_definition, validate_definition};
use flowstate_types::{DefinitionError, MachineDefinition};

/// Read and parse a definition file.
pub async fn load_definition(file: &Path) -> Result<MachineDefinition> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    parse_definition(&text).with_context(|| format!("failed to parse {}", file.display()))
}

/// Returns whether the definition is valid. I/O and JSON syntax problems are
/// errors; structural problems are reported and yield `false`.
pub async fn validate(file: &Path, json: bool) -> Result<bool> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let result = parse_definition(&text).and_then(|def| {
        validate_definition(&def)?;
        Ok(def)
    });

    match (&result, json) {
        (Ok(def), true) => {
            let report = serde_json::json!({
                "valid": true,
                "start_at": def.start_at,
                "states": def.states.len(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        (Err(err), true) => {
            let report = serde_json::json!({ "valid": false, "error": err.to_string() });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        (Ok(def), false) => {
            println!(
                "  {} {} is valid ({} states, starts at {})",
                style("*").green().bold(),
                style(file.display()).cyan(),
                def.states.len(),
                style(&def.start_at).cyan()
            );
        }
        (Err(DefinitionError::Validation(msg)), false) => {
            println!(
                "  {} {} is invalid:",
                style("x").red().bold(),
                style(file.display()).cyan()
            );
            for problem in msg.split("; ") {
                println!("    - {problem}");
            }
        }
        (Err(err), false) => {
            println!("  {} {}", style("x").red().bold(), err);
        }
    }

    Ok(result.is_ok())
}
