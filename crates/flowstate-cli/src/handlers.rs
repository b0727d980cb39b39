//! Built-in demo handlers.
//!
//! Small, deterministic task implementations so definitions can be run from
//! the command line without any host code:
//!
//! | Resource    | Behaviour                                                     |
//! |-------------|---------------------------------------------------------------|
//! | `echo`      | returns its input                                             |
//! | `fail`      | fails with `Error`/`Cause` taken from the input               |
//! | `sleep`     | waits `seconds` (default 1), then returns its input           |
//! | `uppercase` | upper-cases a string, or the `text` field of an object        |
//! | `sum`       | adds a list of numbers, or the `values` field of an object    |

use std::time::Duration;

use serde_json::{Value, json};

use flowstate_core::HandlerRegistry;
use flowstate_types::StatesError;

const INVALID_INPUT: &str = "InvalidInput";

/// Registry with every built-in handler.
pub fn builtin() -> HandlerRegistry {
    HandlerRegistry::new()
        .with_fn("echo", |input, _ctx| async move { Ok(input) })
        .with_fn("fail", |input, _ctx| async move { Err(fail(&input)) })
        .with_fn("sleep", |input, _ctx| async move {
            let secs = input
                .get("seconds")
                .and_then(Value::as_f64)
                .unwrap_or(1.0)
                .max(0.0);
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Ok(input)
        })
        .with_fn("uppercase", |input, _ctx| async move { uppercase(&input) })
        .with_fn("sum", |input, _ctx| async move { sum(&input) })
}

/// Names and one-line descriptions, in display order.
pub fn describe() -> Vec<(&'static str, &'static str)> {
    vec![
        ("echo", "returns its input"),
        ("fail", "fails with {\"error\", \"cause\"} from the input"),
        ("sleep", "waits {\"seconds\"} (default 1) and returns its input"),
        ("uppercase", "upper-cases a string or its {\"text\"} field"),
        ("sum", "adds a list of numbers or its {\"values\"} field"),
    ]
}

fn fail(input: &Value) -> StatesError {
    let name = input
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("DemoError");
    let cause = input
        .get("cause")
        .and_then(Value::as_str)
        .unwrap_or("failed on request");
    StatesError::custom(name, cause)
}

fn uppercase(input: &Value) -> Result<Value, StatesError> {
    let text = match input {
        Value::String(s) => s.as_str(),
        other => other
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| StatesError::custom(INVALID_INPUT, "expected a string or {\"text\"}"))?,
    };
    Ok(json!(text.to_uppercase()))
}

fn sum(input: &Value) -> Result<Value, StatesError> {
    let values = match input {
        Value::Array(items) => items,
        other => other
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| StatesError::custom(INVALID_INPUT, "expected a list or {\"values\"}"))?,
    };
    let mut total = 0.0;
    let mut integral = true;
    for value in values {
        let n = value
            .as_f64()
            .ok_or_else(|| StatesError::custom(INVALID_INPUT, format!("{value} is not a number")))?;
        integral &= value.is_i64() || value.is_u64();
        total += n;
    }
    if integral && total.abs() < i64::MAX as f64 {
        Ok(json!(total as i64))
    } else {
        Ok(json!(total))
    }
}
