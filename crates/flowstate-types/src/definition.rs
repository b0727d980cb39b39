//! Machine definition types.
//!
//! A `MachineDefinition` is the read-only input to the interpreter: a start
//! state key plus a mapping of state keys to `State` values. Field names follow
//! the state language's PascalCase convention so definitions round-trip
//! through JSON unchanged:
//!
//! ```json
//! {
//!   "StartAt": "Greet",
//!   "States": {
//!     "Greet": { "Type": "Task", "Resource": "greet", "End": true }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// MachineDefinition
// ---------------------------------------------------------------------------

/// The declarative graph of states describing a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MachineDefinition {
    /// Key of the first state to run.
    pub start_at: String,
    /// All states of this machine, keyed by state name.
    pub states: BTreeMap<String, State>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl MachineDefinition {
    /// Look up a state by key.
    pub fn state(&self, key: &str) -> Option<&State> {
        self.states.get(key)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One node of the graph.
///
/// The type-specific payload lives in `kind` (tagged by `Type`); the fields
/// shared by every state type sit alongside it.
///
/// `InputPath`, `OutputPath` and `ResultPath` distinguish "absent" (`None`)
/// from an explicit JSON `null` (`Some(None)`): a null `InputPath` feeds `{}`
/// to the state, a null `OutputPath` emits `{}`, and a null `ResultPath`
/// discards the result and passes the input through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    #[serde(flatten)]
    pub kind: StateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub input_path: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub output_path: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub result_path: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<RetryRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<CatchRule>,
}

impl State {
    /// Wrap a kind with all common fields empty.
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            next: None,
            end: false,
            comment: None,
            input_path: None,
            output_path: None,
            result_path: None,
            parameters: None,
            result_selector: None,
            retry: Vec::new(),
            catch: Vec::new(),
        }
    }

    /// The discriminant of this state's kind.
    pub fn state_type(&self) -> StateType {
        self.kind.state_type()
    }

    /// Whether this state ends its machine on its own (Succeed and Fail).
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, StateKind::Succeed | StateKind::Fail(_))
    }
}

/// Deserialize a present-but-possibly-null field into `Some(inner)`.
///
/// Used with `#[serde(default)]` so that a missing key stays `None`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

// ---------------------------------------------------------------------------
// StateKind
// ---------------------------------------------------------------------------

/// Type-specific payload of a state, internally tagged by `Type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum StateKind {
    Pass(PassState),
    Task(TaskState),
    Choice(ChoiceState),
    Wait(WaitState),
    Succeed,
    Fail(FailState),
    Parallel(ParallelState),
    Map(MapState),
}

impl StateKind {
    pub fn state_type(&self) -> StateType {
        match self {
            StateKind::Pass(_) => StateType::Pass,
            StateKind::Task(_) => StateType::Task,
            StateKind::Choice(_) => StateType::Choice,
            StateKind::Wait(_) => StateType::Wait,
            StateKind::Succeed => StateType::Succeed,
            StateKind::Fail(_) => StateType::Fail,
            StateKind::Parallel(_) => StateType::Parallel,
            StateKind::Map(_) => StateType::Map,
        }
    }
}

/// Discriminant of `StateKind`, used for log tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateType {
    Pass,
    Task,
    Choice,
    Wait,
    Succeed,
    Fail,
    Parallel,
    Map,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Pass => "Pass",
            StateType::Task => "Task",
            StateType::Choice => "Choice",
            StateType::Wait => "Wait",
            StateType::Succeed => "Succeed",
            StateType::Fail => "Fail",
            StateType::Parallel => "Parallel",
            StateType::Map => "Map",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    /// Literal output; when absent the (parameterized) input passes through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    /// Name of the host handler to invoke.
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_path: Option<String>,
    /// RFC 3339 timestamp to wait until.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    pub branches: Vec<MachineDefinition>,
}

/// Configuration of a Map state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapState {
    /// Path to the item list (defaults to the whole effective input).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_path: Option<String>,
    /// Handler that produces the item list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_reader: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_batcher: Option<ItemBatcher>,
    /// Template building each item's processor input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_selector: Option<Value>,
    /// Machine run once per item.
    #[serde(alias = "Iterator")]
    pub item_processor: MachineDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_count_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerated_failure_percentage_path: Option<String>,
    /// Handler receiving the full result list; its output becomes the Map output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_writer: Option<ResourceRef>,
}

impl MapState {
    /// A Map over the whole input with the given processor and no limits.
    pub fn new(item_processor: MachineDefinition) -> Self {
        Self {
            items_path: None,
            item_reader: None,
            item_batcher: None,
            item_selector: None,
            item_processor,
            max_concurrency: None,
            max_concurrency_path: None,
            tolerated_failure_count: None,
            tolerated_failure_count_path: None,
            tolerated_failure_percentage: None,
            tolerated_failure_percentage_path: None,
            result_writer: None,
        }
    }
}

/// Reference to a host handler plus optional templated parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResourceRef {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Regroups Map items before processing.
///
/// With a `Resource`, the handler receives `{"Items": [...], "BatchInput": ...}`
/// and must return the new item list. Otherwise items are chunked into
/// `{"Items": [...]}` objects of at most `MaxItemsPerBatch` elements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemBatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items_per_batch: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_input: Option<Value>,
}

// ---------------------------------------------------------------------------
// Retry / Catch
// ---------------------------------------------------------------------------

fn default_interval_seconds() -> f64 {
    1.0
}

fn default_backoff_rate() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    3
}

/// One retry policy entry. Each rule keeps its own attempt counter for the
/// lifetime of a single state execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryRule {
    pub error_equals: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: f64,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Upper bound on a single computed backoff delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<f64>,
}

impl RetryRule {
    /// A rule with the default interval (1s), backoff rate (2.0) and attempts (3).
    pub fn new(error_equals: Vec<String>) -> Self {
        Self {
            error_equals,
            interval_seconds: default_interval_seconds(),
            backoff_rate: default_backoff_rate(),
            max_attempts: default_max_attempts(),
            max_delay_seconds: None,
        }
    }
}

/// One catch policy entry: first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatchRule {
    pub error_equals: Vec<String>,
    pub next: String,
    #[serde(
        default,
        deserialize_with = "nullable",
        skip_serializing_if = "Option::is_none"
    )]
    pub result_path: Option<Option<String>>,
}

// ---------------------------------------------------------------------------
// Choice rules
// ---------------------------------------------------------------------------

/// A choice rule: either a comparison leaf (`Variable` plus exactly one
/// operator key) or a boolean combinator (`And` / `Or` / `Not`).
///
/// Operator keys are kept verbatim in `operators` and interpreted by the
/// choice evaluator, so unknown operators surface as validation errors
/// rather than deserialization failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceRule {
    /// Only meaningful on top-level rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub and: Option<Vec<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not: Option<Box<ChoiceRule>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub operators: Map<String, Value>,
}

impl ChoiceRule {
    /// Build a comparison leaf.
    pub fn leaf(variable: &str, operator: &str, operand: Value) -> Self {
        let mut operators = Map::new();
        operators.insert(operator.to_string(), operand);
        Self {
            variable: Some(variable.to_string()),
            operators,
            ..Self::default()
        }
    }

    /// Set the transition target of a top-level rule.
    pub fn with_next(mut self, next: &str) -> Self {
        self.next = Some(next.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
