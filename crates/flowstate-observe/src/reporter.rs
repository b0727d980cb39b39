//! Console execution reporter.
//!
//! `ConsoleReporter` is a [`LogSink`] that turns the engine's effect stream
//! into an indented trace, one line per interesting event, nested by
//! execution depth:
//!
//! ```text
//! > start Fetch
//!   Fetch (Task)
//!     -> fetch {"id":1}
//!     retry 1 in 0.5s: States.Timeout
//!   Done (Succeed)
//! ok {"id":1,"body":"..."}
//! ```
//!
//! Data-flow effects (`SelectInput`, `BuildParameters`, ...) are only shown
//! in verbose mode.

use std::io::{self, Write};
use std::sync::Mutex;

use console::style;
use serde_json::Value;

use flowstate_core::{LogSink, StepMeta};

/// Values longer than this are cut with an ellipsis.
const MAX_VALUE_WIDTH: usize = 120;

/// Renders execution events to a writer (stderr by default).
pub struct ConsoleReporter {
    out: Mutex<Box<dyn Write + Send>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(out: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            out: Mutex::new(out),
            verbose,
        }
    }

    pub fn stderr(verbose: bool) -> Self {
        Self::new(Box::new(io::stderr()), verbose)
    }

    /// The line for one event, or `None` when the event is not shown.
    pub fn render(&self, meta: &StepMeta, event: &str, args: &[Value]) -> Option<String> {
        let indent = "  ".repeat(meta.depth as usize);
        let arg = |i: usize| args.get(i).map(compact).unwrap_or_default();

        let body = match event {
            "MachineStarted" => format!(
                "{} start {}",
                style(">").cyan().bold(),
                style(&meta.state).cyan()
            ),
            "MachineSucceeded" => format!("{} {}", style("ok").green().bold(), arg(0)),
            "MachineFailed" => {
                let name = args
                    .first()
                    .and_then(|v| v.get("Error"))
                    .and_then(Value::as_str)
                    .unwrap_or("failed");
                let cause = args
                    .first()
                    .and_then(|v| v.get("Cause"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                format!("{} {}: {}", style("failed").red().bold(), name, cause)
            }
            "Initialize" => {
                let kind = meta.state_type.map(|t| t.as_str()).unwrap_or("?");
                format!("  {} ({})", style(&meta.state).bold(), style(kind).dim())
            }
            "Invoke" => format!(
                "    {} {} {}",
                style("->").cyan(),
                arg(0).trim_matches('"'),
                arg(1)
            ),
            "Backoff" => {
                let error = args
                    .get(2)
                    .and_then(|v| v.get("Error"))
                    .and_then(Value::as_str)
                    .unwrap_or("error");
                format!(
                    "    {} {} in {}s: {}",
                    style("retry").yellow(),
                    arg(1),
                    arg(0),
                    error
                )
            }
            "Wait" => format!("    {} {}s", style("wait").dim(), arg(0)),
            other if self.verbose => {
                let rendered: Vec<String> = args.iter().map(compact).collect();
                format!("    {} {}", style(other).dim(), rendered.join(" "))
            }
            _ => return None,
        };
        Some(format!("{indent}{body}"))
    }
}

impl LogSink for ConsoleReporter {
    fn log(&self, meta: &StepMeta, event: &str, args: &[Value]) {
        let Some(line) = self.render(meta, event, args) else {
            return;
        };
        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(out, "{line}") {
            tracing::debug!(error = %e, "reporter write failed");
        }
    }
}

/// Single-line JSON, truncated to [`MAX_VALUE_WIDTH`] characters.
fn compact(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= MAX_VALUE_WIDTH {
        return text;
    }
    let cut: String = text.chars().take(MAX_VALUE_WIDTH).collect();
    format!("{cut}...")
}
