use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use thiserror::Error;

/// Wildcard error name matching every error except cancellation.
pub const ALL_ERRORS: &str = "States.ALL";

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Built-in error categories of the runtime.
///
/// A user-thrown error (from a Fail state or a handler) carries a custom name
/// instead; its kind is `TaskFailed` so that `States.TaskFailed` catches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BranchFailed,
    ExceedToleratedFailureThreshold,
    HeartbeatTimeout,
    IntrinsicFailure,
    ItemReaderFailed,
    NoChoiceMatched,
    ParameterPathFailure,
    Permissions,
    QueryEvaluationError,
    ResultPathMatchFailure,
    ResultWriterFailed,
    TaskFailed,
    Timeout,
    Runtime,
    /// Cancellation. Never retried or caught.
    Aborted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BranchFailed => "States.BranchFailed",
            ErrorKind::ExceedToleratedFailureThreshold => {
                "States.ExceedToleratedFailureThreshold"
            }
            ErrorKind::HeartbeatTimeout => "States.HeartbeatTimeout",
            ErrorKind::IntrinsicFailure => "States.IntrinsicFailure",
            ErrorKind::ItemReaderFailed => "States.ItemReaderFailed",
            ErrorKind::NoChoiceMatched => "States.NoChoiceMatched",
            ErrorKind::ParameterPathFailure => "States.ParameterPathFailure",
            ErrorKind::Permissions => "States.Permissions",
            ErrorKind::QueryEvaluationError => "States.QueryEvaluationError",
            ErrorKind::ResultPathMatchFailure => "States.ResultPathMatchFailure",
            ErrorKind::ResultWriterFailed => "States.ResultWriterFailed",
            ErrorKind::TaskFailed => "States.TaskFailed",
            ErrorKind::Timeout => "States.Timeout",
            ErrorKind::Runtime => "States.Runtime",
            ErrorKind::Aborted => "States.Aborted",
        }
    }

    /// Parse a `States.*` name back into a kind.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "States.BranchFailed" => ErrorKind::BranchFailed,
            "States.ExceedToleratedFailureThreshold" => ErrorKind::ExceedToleratedFailureThreshold,
            "States.HeartbeatTimeout" => ErrorKind::HeartbeatTimeout,
            "States.IntrinsicFailure" => ErrorKind::IntrinsicFailure,
            "States.ItemReaderFailed" => ErrorKind::ItemReaderFailed,
            "States.NoChoiceMatched" => ErrorKind::NoChoiceMatched,
            "States.ParameterPathFailure" => ErrorKind::ParameterPathFailure,
            "States.Permissions" => ErrorKind::Permissions,
            "States.QueryEvaluationError" => ErrorKind::QueryEvaluationError,
            "States.ResultPathMatchFailure" => ErrorKind::ResultPathMatchFailure,
            "States.ResultWriterFailed" => ErrorKind::ResultWriterFailed,
            "States.TaskFailed" => ErrorKind::TaskFailed,
            "States.Timeout" => ErrorKind::Timeout,
            "States.Runtime" => ErrorKind::Runtime,
            "States.Aborted" => ErrorKind::Aborted,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StatesError
// ---------------------------------------------------------------------------

/// A runtime error raised while executing a machine.
///
/// Cheap to clone: the optional underlying cause is held behind an `Arc` so
/// the same error can be recorded in a Map result slot and propagated.
#[derive(Clone)]
pub struct StatesError {
    kind: ErrorKind,
    name: Option<String>,
    message: String,
    details: Option<Value>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl StatesError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: None,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// A user-defined error name, e.g. from a Fail state or a handler.
    ///
    /// Names that spell a built-in kind map back to that kind.
    pub fn custom(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        match ErrorKind::from_name(&name) {
            Some(kind) => Self::new(kind, message),
            None => Self {
                name: Some(name),
                ..Self::new(ErrorKind::TaskFailed, message)
            },
        }
    }

    /// The cancellation error.
    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "execution aborted")
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// The matchable error name (`States.*` or the custom name).
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.kind.as_str())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&Value> {
        self.details.as_ref()
    }

    /// True for user-defined names, false for built-in kinds.
    pub fn is_custom(&self) -> bool {
        self.name.is_some()
    }

    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    /// The `{"Error", "Cause"}` object used for catch payloads, Map failure
    /// slots and failed execution output.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("Error".into(), json!(self.name()));
        obj.insert("Cause".into(), json!(self.message));
        if let Some(details) = &self.details {
            obj.insert("Details".into(), details.clone());
        }
        Value::Object(obj)
    }
}

impl fmt::Debug for StatesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatesError")
            .field("name", &self.name())
            .field("message", &self.message)
            .field("details", &self.details)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .finish()
    }
}

impl fmt::Display for StatesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name(), self.message)
    }
}

impl StdError for StatesError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn StdError + 'static))
    }
}

impl PartialEq for StatesError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.name == other.name && self.message == other.message
    }
}

// ---------------------------------------------------------------------------
// DefinitionError
// ---------------------------------------------------------------------------

/// Errors raised before execution starts: the definition itself is unusable.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("failed to parse machine definition: {0}")]
    Parse(String),

    #[error("invalid machine definition: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names_round_trip() {
        for kind in [
            ErrorKind::BranchFailed,
            ErrorKind::ExceedToleratedFailureThreshold,
            ErrorKind::IntrinsicFailure,
            ErrorKind::NoChoiceMatched,
            ErrorKind::Timeout,
            ErrorKind::Aborted,
        ] {
            assert_eq!(ErrorKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::from_name("NetworkError"), None);
    }

    #[test]
    fn test_custom_error_is_task_failed_kind() {
        let err = StatesError::custom("NetworkError", "connection reset");
        assert_eq!(err.name(), "NetworkError");
        assert_eq!(err.kind(), ErrorKind::TaskFailed);
        assert!(err.is_custom());
        assert_eq!(err.to_string(), "NetworkError: connection reset");
    }

    #[test]
    fn test_custom_with_builtin_name_maps_to_kind() {
        let err = StatesError::custom("States.Timeout", "slow");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_custom());
    }

    #[test]
    fn test_to_value_shape() {
        let err = StatesError::new(ErrorKind::NoChoiceMatched, "no rule matched");
        assert_eq!(
            err.to_value(),
            json!({ "Error": "States.NoChoiceMatched", "Cause": "no rule matched" })
        );

        let with_details = err.with_details(json!({ "state": "C" }));
        assert_eq!(with_details.to_value()["Details"], json!({ "state": "C" }));
    }

    #[test]
    fn test_source_is_exposed() {
        let inner = StatesError::custom("Boom", "inner failure");
        let outer =
            StatesError::new(ErrorKind::BranchFailed, "branch 0 failed").with_source(inner);
        let source = outer.source().unwrap();
        assert_eq!(source.to_string(), "Boom: inner failure");
    }

    #[test]
    fn test_aborted_is_flagged() {
        assert!(StatesError::aborted().is_aborted());
        assert_eq!(StatesError::aborted().name(), "States.Aborted");
    }
}
