//! Data-flow pipeline helpers.
//!
//! Pure functions behind the per-state pipeline:
//! `InputPath` -> `Parameters` -> action -> `ResultSelector` -> `ResultPath`
//! -> `OutputPath`. The effect executor calls into these; none of them
//! mutate their inputs.

use serde_json::{Map, Value};

use flowstate_types::{ErrorKind, StatesError};

use crate::intrinsic::IntrinsicResolver;
use crate::path::{JsonPath, PathRoot};

/// Key suffix marking a template value as an expression.
pub const EXPRESSION_SUFFIX: &str = ".$";

/// Build a value from a `Parameters` / `ResultSelector` / `ItemSelector`
/// template.
///
/// Keys ending in `.$` have their string value resolved as an expression and
/// are emitted without the suffix. Everything else is copied literally,
/// recursing into nested objects and arrays.
pub fn apply_template(
    template: &Value,
    data: &Value,
    context: &Value,
    intrinsics: &IntrinsicResolver,
) -> Result<Value, StatesError> {
    match template {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                match key.strip_suffix(EXPRESSION_SUFFIX) {
                    Some(name) => {
                        let Some(expr) = value.as_str() else {
                            return Err(StatesError::new(
                                ErrorKind::ParameterPathFailure,
                                format!("value of '{key}' must be a string expression"),
                            ));
                        };
                        out.insert(
                            name.to_string(),
                            resolve_expression(expr, data, context, intrinsics)?,
                        );
                    }
                    None => {
                        out.insert(
                            key.clone(),
                            apply_template(value, data, context, intrinsics)?,
                        );
                    }
                }
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| apply_template(item, data, context, intrinsics))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Resolve one template expression: `$`, `$$`, an intrinsic call, or a path.
pub fn resolve_expression(
    expr: &str,
    data: &Value,
    context: &Value,
    intrinsics: &IntrinsicResolver,
) -> Result<Value, StatesError> {
    match expr {
        "$" => Ok(data.clone()),
        "$$" => Ok(context.clone()),
        _ if IntrinsicResolver::is_intrinsic(expr) => intrinsics.evaluate(expr, data, context),
        _ => query(expr, data, context, ErrorKind::ParameterPathFailure),
    }
}

/// Query `path` against data or context, reporting failure as `kind`.
pub fn query(
    path: &str,
    data: &Value,
    context: &Value,
    kind: ErrorKind,
) -> Result<Value, StatesError> {
    let parsed = JsonPath::parse(path)
        .map_err(|e| StatesError::new(kind, e.to_string()).with_source(e))?;
    let root = match parsed.root() {
        PathRoot::Data => data,
        PathRoot::Context => context,
    };
    parsed
        .query(root)
        .map_err(|e| StatesError::new(kind, e.to_string()).with_source(e))
}

/// Apply an `InputPath` or `OutputPath`.
///
/// Absent passes `value` through; an explicit null yields `{}`.
pub fn select_path(
    path: &Option<Option<String>>,
    value: &Value,
    context: &Value,
) -> Result<Value, StatesError> {
    match path {
        None => Ok(value.clone()),
        Some(None) => Ok(Value::Object(Map::new())),
        Some(Some(p)) => query(p, value, context, ErrorKind::QueryEvaluationError),
    }
}

/// Apply a `ResultPath`: place `result` into a copy of the state's raw input.
///
/// Absent replaces the input wholesale; an explicit null discards the result
/// and passes the input through.
pub fn place_result(
    path: &Option<Option<String>>,
    input: &Value,
    result: Value,
) -> Result<Value, StatesError> {
    let path = match path {
        None => return Ok(result),
        Some(None) => return Ok(input.clone()),
        Some(Some(p)) => p,
    };
    let failure = |e: crate::path::PathError| {
        StatesError::new(ErrorKind::ResultPathMatchFailure, e.to_string()).with_source(e)
    };
    JsonPath::parse(path)
        .map_err(failure)?
        .assign(input, result)
        .map_err(failure)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
