//! Effects and the step executor.
//!
//! State logic never performs I/O directly. Each side-effecting step is
//! described as an [`Effect`] and handed to [`StepExecutor::perform`], which
//! reports it to the log sink (unless quiet) and then carries it out. Quiet
//! mode performs identical work with no observation.

use std::future::{self, Future};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use flowstate_types::{ErrorKind, StateType, StatesError};

use crate::context::{ExecutionContext, LogSink, StepMeta};
use crate::dataflow;
use crate::intrinsic::IntrinsicResolver;

// ---------------------------------------------------------------------------
// Effect
// ---------------------------------------------------------------------------

/// One suspension point of a state's execution.
#[derive(Debug)]
pub enum Effect<'a> {
    /// Bind the state key before anything else runs.
    Initialize,
    /// Apply `InputPath` to the raw input.
    SelectInput {
        path: &'a Option<Option<String>>,
        input: &'a Value,
    },
    /// Build the action input from `Parameters`.
    BuildParameters {
        template: &'a Value,
        input: &'a Value,
    },
    /// Call a registered handler.
    Invoke {
        resource: &'a str,
        input: Value,
        timeout: Option<Duration>,
    },
    /// Reshape the action result with `ResultSelector`.
    SelectResult {
        template: &'a Value,
        result: &'a Value,
    },
    /// Place the result into the raw input via `ResultPath`.
    PlaceResult {
        path: &'a Option<Option<String>>,
        input: &'a Value,
        result: Value,
    },
    /// Apply `OutputPath`.
    SelectOutput {
        path: &'a Option<Option<String>>,
        output: &'a Value,
    },
    /// Build one Map item's input from `ItemSelector` using the item's context.
    SelectItem {
        template: &'a Value,
        input: &'a Value,
        context: &'a Value,
    },
    /// Sleep for a Wait state.
    Wait { duration: Duration },
    /// Sleep before a retry.
    Backoff {
        duration: Duration,
        attempt: u32,
        error: &'a StatesError,
    },
}

impl Effect<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Effect::Initialize => "Initialize",
            Effect::SelectInput { .. } => "SelectInput",
            Effect::BuildParameters { .. } => "BuildParameters",
            Effect::Invoke { .. } => "Invoke",
            Effect::SelectResult { .. } => "SelectResult",
            Effect::PlaceResult { .. } => "PlaceResult",
            Effect::SelectOutput { .. } => "SelectOutput",
            Effect::SelectItem { .. } => "SelectItem",
            Effect::Wait { .. } => "Wait",
            Effect::Backoff { .. } => "Backoff",
        }
    }

    /// Arguments reported to the log sink.
    pub fn args(&self) -> Vec<Value> {
        let path_arg = |p: &Option<Option<String>>| match p {
            None => json!("$"),
            Some(None) => Value::Null,
            Some(Some(p)) => json!(p),
        };
        match self {
            Effect::Initialize => Vec::new(),
            Effect::SelectInput { path, input } => vec![path_arg(path), (*input).clone()],
            Effect::BuildParameters { template, input } => {
                vec![(*template).clone(), (*input).clone()]
            }
            Effect::Invoke {
                resource,
                input,
                timeout,
            } => vec![
                json!(resource),
                input.clone(),
                json!(timeout.map(|t| t.as_secs_f64())),
            ],
            Effect::SelectResult { template, result } => {
                vec![(*template).clone(), (*result).clone()]
            }
            Effect::PlaceResult {
                path,
                input,
                result,
            } => vec![path_arg(path), (*input).clone(), result.clone()],
            Effect::SelectOutput { path, output } => vec![path_arg(path), (*output).clone()],
            Effect::SelectItem {
                template, input, ..
            } => vec![(*template).clone(), (*input).clone()],
            Effect::Wait { duration } => vec![json!(duration.as_secs_f64())],
            Effect::Backoff {
                duration,
                attempt,
                error,
            } => vec![json!(duration.as_secs_f64()), json!(attempt), error.to_value()],
        }
    }
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

/// Performs effects on behalf of one state execution.
pub struct StepExecutor<'a> {
    ctx: &'a ExecutionContext,
    meta: StepMeta,
    entered: DateTime<Utc>,
    context_value: Value,
    intrinsics: IntrinsicResolver,
    sink: Option<Arc<dyn LogSink>>,
}

impl<'a> StepExecutor<'a> {
    pub fn new(ctx: &'a ExecutionContext, state: &str, state_type: StateType) -> Self {
        let entered = Utc::now();
        let sink = if ctx.quiet() { None } else { ctx.log_sink() };
        Self {
            ctx,
            meta: StepMeta {
                state: state.to_string(),
                state_type: Some(state_type),
                depth: ctx.depth(),
            },
            entered,
            context_value: ctx.context_value(state, entered),
            intrinsics: IntrinsicResolver::new(ctx.config().max_intrinsic_depth),
            sink,
        }
    }

    pub fn ctx(&self) -> &'a ExecutionContext {
        self.ctx
    }

    pub fn meta(&self) -> &StepMeta {
        &self.meta
    }

    /// The `$$` object for this state.
    pub fn context_value(&self) -> &Value {
        &self.context_value
    }

    /// The `$$` object this state would see when run under `ctx`.
    pub fn context_value_for(&self, ctx: &ExecutionContext) -> Value {
        ctx.context_value(&self.meta.state, self.entered)
    }

    pub fn intrinsics(&self) -> &IntrinsicResolver {
        &self.intrinsics
    }

    /// Report and perform `effect`.
    pub async fn perform(&self, effect: Effect<'_>) -> Result<Value, StatesError> {
        self.observe(&effect);

        match effect {
            Effect::Initialize => Ok(Value::Null),
            Effect::SelectInput { path, input } => {
                dataflow::select_path(path, input, &self.context_value)
            }
            Effect::BuildParameters { template, input } => {
                dataflow::apply_template(template, input, &self.context_value, &self.intrinsics)
            }
            Effect::Invoke {
                resource,
                input,
                timeout,
            } => self.invoke(resource, input, timeout).await,
            Effect::SelectResult { template, result } => {
                dataflow::apply_template(template, result, &self.context_value, &self.intrinsics)
            }
            Effect::PlaceResult {
                path,
                input,
                result,
            } => dataflow::place_result(path, input, result),
            Effect::SelectOutput { path, output } => {
                dataflow::select_path(path, output, &self.context_value)
            }
            Effect::SelectItem {
                template,
                input,
                context,
            } => dataflow::apply_template(template, input, context, &self.intrinsics),
            Effect::Wait { duration } | Effect::Backoff { duration, .. } => {
                self.sleep(duration).await.map(|()| Value::Null)
            }
        }
    }

    fn observe(&self, effect: &Effect<'_>) {
        let Some(sink) = &self.sink else {
            return;
        };
        tracing::debug!(
            state = %self.meta.state,
            state_type = ?self.meta.state_type,
            depth = self.meta.depth,
            effect = effect.name(),
            "effect"
        );
        sink.log(&self.meta, effect.name(), &effect.args());
    }

    /// Run a handler, racing it against the abort token and the timeout.
    /// The abort token wins ties.
    async fn invoke(
        &self,
        resource: &str,
        input: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, StatesError> {
        let handler = self.ctx.handlers().get(resource).ok_or_else(|| {
            StatesError::new(
                ErrorKind::TaskFailed,
                format!("no handler registered for resource '{resource}'"),
            )
        })?;

        let ctx = self.ctx.clone();
        let mut task = tokio::spawn(async move { handler.invoke(input, ctx).await });
        let token = self.ctx.abort_token();

        tokio::select! {
            biased;
            _ = aborted(token.as_ref()) => {
                tracing::debug!(state = %self.meta.state, resource, "task aborted");
                Err(StatesError::aborted())
            }
            _ = sleep_or_forever(timeout) => {
                let secs = timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
                tracing::debug!(state = %self.meta.state, resource, secs, "task timed out");
                Err(StatesError::new(
                    ErrorKind::Timeout,
                    format!("resource '{resource}' timed out after {secs}s"),
                ))
            }
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(join_err) => Err(StatesError::new(
                    ErrorKind::TaskFailed,
                    format!("handler for '{resource}' did not complete: {join_err}"),
                )
                .with_source(join_err)),
            },
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<(), StatesError> {
        if duration.is_zero() {
            return if self.ctx.is_aborted() {
                Err(StatesError::aborted())
            } else {
                Ok(())
            };
        }
        let token = self.ctx.abort_token();
        tokio::select! {
            biased;
            _ = aborted(token.as_ref()) => Err(StatesError::aborted()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// Resolves when `token` is cancelled; never resolves without a token.
pub(crate) fn aborted(token: Option<&CancellationToken>) -> impl Future<Output = ()> + '_ {
    async move {
        match token {
            Some(token) => token.cancelled().await,
            None => future::pending().await,
        }
    }
}

async fn sleep_or_forever(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
