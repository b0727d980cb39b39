//! Execution context for machine runs.
//!
//! `ExecutionContext` bundles what flows through a run: the handler
//! registry, the abort token, quiet mode, the log sink, nesting depth, the
//! engine config and execution metadata. Contexts form an immutable chain:
//! `derive()` creates a child layer that overrides only what it sets and
//! resolves everything else from its nearest ancestor. The Map scope is the
//! exception, it is local to the layer that set it and never inherited.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use flowstate_types::{EngineConfig, StateType};

use crate::handler::HandlerRegistry;

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

/// Where a step happened: state key, state type and nesting depth.
///
/// Machine lifecycle events carry the state the machine is at: the start
/// state for `MachineStarted`, the last state entered when it finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMeta {
    pub state: String,
    pub state_type: Option<StateType>,
    pub depth: u32,
}

/// Host-supplied observer receiving one call per effect plus machine
/// lifecycle events (`MachineStarted`, `MachineSucceeded`, `MachineFailed`).
pub trait LogSink: Send + Sync {
    fn log(&self, meta: &StepMeta, event: &str, args: &[Value]);
}

// ---------------------------------------------------------------------------
// Context data
// ---------------------------------------------------------------------------

/// The current Map item, visible to templates as `$$.Map`.
#[derive(Debug, Clone, PartialEq)]
pub struct MapScope {
    pub value: Value,
    pub index: usize,
    /// Enclosing item value, or the Map state's input at the outermost level.
    pub parent: Value,
}

/// Per-execution metadata, visible to templates as `$$.Execution`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionInfo {
    pub id: String,
    pub input: Value,
    pub start_time: DateTime<Utc>,
}

impl ExecutionInfo {
    pub fn new(input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            input,
            start_time: Utc::now(),
        }
    }
}

#[derive(Default)]
struct ContextLayer {
    parent: Option<Arc<ContextLayer>>,
    handlers: Option<HandlerRegistry>,
    abort: Option<CancellationToken>,
    quiet: Option<bool>,
    log_sink: Option<Arc<dyn LogSink>>,
    depth: Option<u32>,
    config: Option<Arc<EngineConfig>>,
    execution: Option<Arc<ExecutionInfo>>,
    map_scope: Option<MapScope>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Shared, immutable context for one machine invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    layer: Arc<ContextLayer>,
}

impl ExecutionContext {
    /// A root context with only handlers set.
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self::builder().handlers(handlers).build()
    }

    /// Start building a root context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder {
            layer: ContextLayer::default(),
        }
    }

    /// Start building a child context (depth + 1, no Map scope).
    pub fn derive(&self) -> ContextBuilder {
        ContextBuilder {
            layer: ContextLayer {
                parent: Some(Arc::clone(&self.layer)),
                depth: Some(self.depth().saturating_add(1)),
                ..ContextLayer::default()
            },
        }
    }

    fn resolve<T>(&self, field: impl Fn(&ContextLayer) -> Option<T>) -> Option<T> {
        let mut layer = Some(&self.layer);
        while let Some(current) = layer {
            if let Some(value) = field(current) {
                return Some(value);
            }
            layer = current.parent.as_ref();
        }
        None
    }

    pub fn handlers(&self) -> HandlerRegistry {
        self.resolve(|l| l.handlers.clone()).unwrap_or_default()
    }

    pub fn abort_token(&self) -> Option<CancellationToken> {
        self.resolve(|l| l.abort.clone())
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_token().is_some_and(|t| t.is_cancelled())
    }

    /// Explicit quiet setting, else the config's.
    pub fn quiet(&self) -> bool {
        self.resolve(|l| l.quiet)
            .unwrap_or_else(|| self.config().quiet)
    }

    pub fn log_sink(&self) -> Option<Arc<dyn LogSink>> {
        self.resolve(|l| l.log_sink.clone())
    }

    pub fn depth(&self) -> u32 {
        self.resolve(|l| l.depth).unwrap_or(0)
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.resolve(|l| l.config.clone()).unwrap_or_default()
    }

    pub fn execution(&self) -> Option<Arc<ExecutionInfo>> {
        self.resolve(|l| l.execution.clone())
    }

    /// Map scope of this layer only.
    pub fn map_scope(&self) -> Option<&MapScope> {
        self.layer.map_scope.as_ref()
    }

    /// The `$$` object seen by templates and choice rules in `state`.
    pub fn context_value(&self, state: &str, entered: DateTime<Utc>) -> Value {
        let mut obj = Map::new();
        if let Some(exec) = self.execution() {
            obj.insert(
                "Execution".into(),
                json!({
                    "Id": exec.id,
                    "Input": exec.input,
                    "StartTime": exec.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                }),
            );
        }
        obj.insert(
            "State".into(),
            json!({
                "Name": state,
                "EnteredTime": entered.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        );
        if let Some(scope) = self.map_scope() {
            obj.insert(
                "Map".into(),
                json!({
                    "Item": { "Value": scope.value, "Index": scope.index },
                    "Parent": scope.parent,
                }),
            );
        }
        obj.insert("Depth".into(), json!(self.depth()));
        Value::Object(obj)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("depth", &self.depth())
            .field("quiet", &self.quiet())
            .field("aborted", &self.is_aborted())
            .field("handlers", &self.handlers())
            .field("map_scope", &self.map_scope())
            .field("has_parent", &self.layer.parent.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContextBuilder
// ---------------------------------------------------------------------------

/// Sets the fields of one context layer. Unset fields are inherited.
pub struct ContextBuilder {
    layer: ContextLayer,
}

impl ContextBuilder {
    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.layer.handlers = Some(handlers);
        self
    }

    pub fn abort_token(mut self, token: CancellationToken) -> Self {
        self.layer.abort = Some(token);
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.layer.quiet = Some(quiet);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.layer.log_sink = Some(sink);
        self
    }

    pub fn depth(mut self, depth: u32) -> Self {
        self.layer.depth = Some(depth);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.layer.config = Some(Arc::new(config));
        self
    }

    pub fn execution(mut self, info: ExecutionInfo) -> Self {
        self.layer.execution = Some(Arc::new(info));
        self
    }

    pub fn map_scope(mut self, scope: MapScope) -> Self {
        self.layer.map_scope = Some(scope);
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            layer: Arc::new(self.layer),
        }
    }
}
