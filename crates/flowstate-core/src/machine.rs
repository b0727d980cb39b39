//! Execution core.
//!
//! Drives a machine from `StartAt` until a state ends it. Each state runs the
//! data-flow pipeline around its action:
//!
//! 1. Initialize
//! 2. `InputPath`
//! 3. `Parameters`
//! 4. the action, inside the Retry loop
//! 5. `ResultSelector`
//! 6. `ResultPath` (against the raw state input)
//! 7. `OutputPath`
//! 8. transition
//!
//! Any failure in steps 2-7 is offered to the state's Catch rules. Abort
//! errors bypass both Retry and Catch.

use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use flowstate_types::{
    DefinitionError, ErrorKind, ExecutionStatus, MachineDefinition, State, StateKind, StatesError,
};

use crate::context::{ExecutionContext, ExecutionInfo, StepMeta};
use crate::effect::{Effect, StepExecutor};
use crate::retry::{RetryDecision, RetryTracker, find_catcher};
use crate::state_runner::{ActionOutput, run_action};
use crate::validate::validate_definition;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Terminal result of a machine run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded(Value),
    Failed(StatesError),
}

impl Outcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Outcome::Succeeded(_) => ExecutionStatus::Succeeded,
            Outcome::Failed(_) => ExecutionStatus::Failed,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }

    /// `(status, output)` where a failure's output is `{"Error", "Cause"}`.
    pub fn into_parts(self) -> (ExecutionStatus, Value) {
        match self {
            Outcome::Succeeded(v) => (ExecutionStatus::Succeeded, v),
            Outcome::Failed(e) => (ExecutionStatus::Failed, e.to_value()),
        }
    }

    pub fn into_result(self) -> Result<Value, StatesError> {
        match self {
            Outcome::Succeeded(v) => Ok(v),
            Outcome::Failed(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse a machine definition from JSON text.
pub fn parse_definition(json: &str) -> Result<MachineDefinition, DefinitionError> {
    serde_json::from_str(json).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Validate `def` and run it to completion with `input`.
///
/// Validation failures are returned before any state runs. Runtime failures
/// are reported as [`Outcome::Failed`], never as an `Err`.
pub async fn execute(
    def: &MachineDefinition,
    ctx: &ExecutionContext,
    input: Value,
) -> Result<Outcome, DefinitionError> {
    validate_definition(def)?;

    let info = ExecutionInfo::new(input.clone());
    let execution_id = info.id.clone();
    let root = ctx.derive().depth(ctx.depth()).execution(info).build();

    tracing::info!(execution_id = %execution_id, start_at = %def.start_at, "execution started");
    let outcome = run_machine(def, &root, input).await;
    tracing::info!(execution_id = %execution_id, status = %outcome.status(), "execution finished");
    Ok(outcome)
}

/// Run `def` under `ctx` without validating it. Used for nested machines.
pub fn run_machine<'a>(
    def: &'a MachineDefinition,
    ctx: &'a ExecutionContext,
    input: Value,
) -> BoxFuture<'a, Outcome> {
    Box::pin(async move {
        let mut lifecycle = Lifecycle::new(ctx, def);
        lifecycle.emit("MachineStarted", &input);

        let mut current = def.start_at.clone();
        let mut data = input;
        loop {
            if ctx.is_aborted() {
                tracing::debug!(state = %current, depth = ctx.depth(), "execution aborted");
                let err = StatesError::aborted();
                lifecycle.emit("MachineFailed", &err.to_value());
                return Outcome::Failed(err);
            }

            let Some(state) = def.state(&current) else {
                let err = StatesError::new(
                    ErrorKind::Runtime,
                    format!("state '{current}' does not exist"),
                );
                lifecycle.emit("MachineFailed", &err.to_value());
                return Outcome::Failed(err);
            };

            lifecycle.enter(&current, state);
            match run_state(&current, state, ctx, data).await {
                Ok(Transition::Next(next, output)) => {
                    current = next;
                    data = output;
                }
                Ok(Transition::End(output)) => {
                    lifecycle.emit("MachineSucceeded", &output);
                    return Outcome::Succeeded(output);
                }
                Err(err) => {
                    lifecycle.emit("MachineFailed", &err.to_value());
                    return Outcome::Failed(err);
                }
            }
        }
    })
}

/// Machine-level log events, tagged with the state the machine is at.
struct Lifecycle<'a> {
    ctx: &'a ExecutionContext,
    meta: StepMeta,
}

impl<'a> Lifecycle<'a> {
    fn new(ctx: &'a ExecutionContext, def: &MachineDefinition) -> Self {
        Self {
            ctx,
            meta: StepMeta {
                state: def.start_at.clone(),
                state_type: def.state(&def.start_at).map(State::state_type),
                depth: ctx.depth(),
            },
        }
    }

    fn enter(&mut self, key: &str, state: &State) {
        self.meta.state = key.to_string();
        self.meta.state_type = Some(state.state_type());
    }

    fn emit(&self, event: &str, value: &Value) {
        if self.ctx.quiet() {
            return;
        }
        tracing::debug!(depth = self.meta.depth, event, "machine lifecycle");
        if let Some(sink) = self.ctx.log_sink() {
            sink.log(&self.meta, event, std::slice::from_ref(value));
        }
    }
}

// ---------------------------------------------------------------------------
// Per-state pipeline
// ---------------------------------------------------------------------------

enum Transition {
    Next(String, Value),
    End(Value),
}

async fn run_state(
    key: &str,
    state: &State,
    ctx: &ExecutionContext,
    raw_input: Value,
) -> Result<Transition, StatesError> {
    let exec = StepExecutor::new(ctx, key, state.state_type());
    exec.perform(Effect::Initialize).await?;

    match run_pipeline(&exec, state, &raw_input).await {
        Ok(transition) => Ok(transition),
        Err(err) => recover(&exec, state, &raw_input, err).await,
    }
}

async fn run_pipeline(
    exec: &StepExecutor<'_>,
    state: &State,
    raw_input: &Value,
) -> Result<Transition, StatesError> {
    let effective = exec
        .perform(Effect::SelectInput {
            path: &state.input_path,
            input: raw_input,
        })
        .await?;

    let params = match &state.parameters {
        Some(template) => {
            exec.perform(Effect::BuildParameters {
                template,
                input: &effective,
            })
            .await?
        }
        None => effective,
    };

    let ActionOutput { value, next } = run_with_retry(exec, state, &params).await?;

    let result = match &state.result_selector {
        Some(template) => {
            exec.perform(Effect::SelectResult {
                template,
                result: &value,
            })
            .await?
        }
        None => value,
    };

    let placed = exec
        .perform(Effect::PlaceResult {
            path: &state.result_path,
            input: raw_input,
            result,
        })
        .await?;

    let output = exec
        .perform(Effect::SelectOutput {
            path: &state.output_path,
            output: &placed,
        })
        .await?;

    Ok(transition(state, next, output))
}

/// Run the action, re-running it with the same input while a Retry rule
/// allows.
async fn run_with_retry(
    exec: &StepExecutor<'_>,
    state: &State,
    input: &Value,
) -> Result<ActionOutput, StatesError> {
    let match_messages = exec.ctx().config().match_error_messages;
    let mut tracker = RetryTracker::new(&state.retry);

    loop {
        let err = match run_action(exec, state, input).await {
            Ok(output) => return Ok(output),
            Err(err) if err.is_aborted() => return Err(err),
            Err(err) => err,
        };

        match tracker.next_decision(&state.retry, &err, match_messages) {
            RetryDecision::Retry {
                rule_index,
                attempt,
                delay,
            } => {
                tracing::debug!(
                    state = %exec.meta().state,
                    error = err.name(),
                    rule_index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retry scheduled"
                );
                exec.perform(Effect::Backoff {
                    duration: delay,
                    attempt,
                    error: &err,
                })
                .await?;
            }
            RetryDecision::Exhausted => return Err(err),
        }
    }
}

/// Route a failure to the first matching Catch rule.
async fn recover(
    exec: &StepExecutor<'_>,
    state: &State,
    raw_input: &Value,
    err: StatesError,
) -> Result<Transition, StatesError> {
    let match_messages = exec.ctx().config().match_error_messages;
    let Some(catcher) = find_catcher(&state.catch, &err, match_messages) else {
        return Err(err);
    };

    tracing::debug!(
        state = %exec.meta().state,
        error = err.name(),
        next = %catcher.next,
        "catch taken"
    );

    let output = match &catcher.result_path {
        None => json!({ "error": err.to_value() }),
        Some(_) => {
            exec.perform(Effect::PlaceResult {
                path: &catcher.result_path,
                input: raw_input,
                result: err.to_value(),
            })
            .await?
        }
    };
    Ok(Transition::Next(catcher.next.clone(), output))
}

fn transition(state: &State, next_override: Option<String>, output: Value) -> Transition {
    if let Some(next) = next_override {
        return Transition::Next(next, output);
    }
    if matches!(state.kind, StateKind::Succeed) || state.end {
        return Transition::End(output);
    }
    match &state.next {
        Some(next) => Transition::Next(next.clone(), output),
        None => Transition::End(output),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use flowstate_types::StateType;
    use tokio_util::sync::CancellationToken;

    use crate::context::LogSink;
    use crate::handler::HandlerRegistry;

    fn def(value: Value) -> MachineDefinition {
        serde_json::from_value(value).unwrap()
    }

    async fn run(definition: Value, ctx: &ExecutionContext, input: Value) -> Outcome {
        execute(&def(definition), ctx, input).await.unwrap()
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<(StepMeta, String)>>);

    impl LogSink for Recording {
        fn log(&self, meta: &StepMeta, event: &str, _args: &[Value]) {
            self.0
                .lock()
                .unwrap()
                .push((meta.clone(), event.to_string()));
        }
    }

    // -----------------------------------------------------------------------
    // Pass / pipeline
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_pass_chain_is_identity_without_result() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let outcome = run(
            json!({
                "StartAt": "A",
                "States": {
                    "A": { "Type": "Pass", "Next": "B" },
                    "B": { "Type": "Pass", "End": true }
                }
            }),
            &ctx,
            json!({ "keep": [1, 2, 3] }),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!({ "keep": [1, 2, 3] })));
    }

    #[tokio::test]
    async fn test_pass_result_replaces_input() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let outcome = run(
            json!({
                "StartAt": "A",
                "States": { "A": { "Type": "Pass", "Result": { "x": 1 }, "End": true } }
            }),
            &ctx,
            json!({ "ignored": true }),
        )
        .await;
        let (status, output) = outcome.into_parts();
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(output, json!({ "x": 1 }));
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let handlers = HandlerRegistry::new().with_fn("add", |input, _ctx| async move {
            let a = input["a"].as_i64().unwrap_or(0);
            let b = input["b"].as_i64().unwrap_or(0);
            Ok(json!({ "sum": a + b, "noise": true }))
        });
        let ctx = ExecutionContext::new(handlers);
        let outcome = run(
            json!({
                "StartAt": "Add",
                "States": {
                    "Add": {
                        "Type": "Task",
                        "Resource": "add",
                        "InputPath": "$.numbers",
                        "Parameters": { "a.$": "$.x", "b.$": "$.y", "label": "fixed" },
                        "ResultSelector": { "total.$": "$.sum" },
                        "ResultPath": "$.result",
                        "OutputPath": "$.result",
                        "End": true
                    }
                }
            }),
            &ctx,
            json!({ "numbers": { "x": 2, "y": 3 } }),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!({ "total": 5 })));
    }

    #[tokio::test]
    async fn test_result_path_keeps_raw_input() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let outcome = run(
            json!({
                "StartAt": "A",
                "States": {
                    "A": {
                        "Type": "Pass",
                        "InputPath": "$.inner",
                        "ResultPath": "$.copy",
                        "End": true
                    }
                }
            }),
            &ctx,
            json!({ "inner": { "v": 1 } }),
        )
        .await;
        assert_eq!(
            outcome,
            Outcome::Succeeded(json!({ "inner": { "v": 1 }, "copy": { "v": 1 } }))
        );
    }

    #[tokio::test]
    async fn test_context_object_in_parameters() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let outcome = run(
            json!({
                "StartAt": "Named",
                "States": {
                    "Named": {
                        "Type": "Pass",
                        "Parameters": { "me.$": "$$.State.Name", "orig.$": "$$.Execution.Input.v" },
                        "End": true
                    }
                }
            }),
            &ctx,
            json!({ "v": 9 }),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!({ "me": "Named", "orig": 9 })));
    }

    // -----------------------------------------------------------------------
    // Fail / Choice
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_fail_state() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let outcome = run(
            json!({
                "StartAt": "F",
                "States": { "F": { "Type": "Fail", "Error": "Custom", "Cause": "bad input" } }
            }),
            &ctx,
            json!({}),
        )
        .await;
        let (status, output) = outcome.into_parts();
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(output, json!({ "Error": "Custom", "Cause": "bad input" }));
    }

    #[tokio::test]
    async fn test_choice_string_matches_regex() {
        let definition = json!({
            "StartAt": "C",
            "States": {
                "C": {
                    "Type": "Choice",
                    "Choices": [{ "Variable": "$.s", "StringMatches": "^ab+c$", "Next": "Hit" }],
                    "Default": "Miss"
                },
                "Hit": { "Type": "Pass", "Result": "hit", "End": true },
                "Miss": { "Type": "Pass", "Result": "miss", "End": true }
            }
        });
        let ctx = ExecutionContext::new(HandlerRegistry::new());

        let outcome = run(definition.clone(), &ctx, json!({ "s": "abbbc" })).await;
        assert_eq!(outcome, Outcome::Succeeded(json!("hit")));
        let outcome = run(definition, &ctx, json!({ "s": "abd" })).await;
        assert_eq!(outcome, Outcome::Succeeded(json!("miss")));
    }

    #[tokio::test]
    async fn test_choice_routes_and_no_match_fails() {
        let definition = json!({
            "StartAt": "C",
            "States": {
                "C": {
                    "Type": "Choice",
                    "Choices": [
                        { "Variable": "$.n", "NumericGreaterThan": 0, "Next": "Positive" },
                        { "Variable": "$.n", "NumericGreaterThan": 10, "Next": "Big" }
                    ]
                },
                "Positive": { "Type": "Pass", "Result": "positive", "End": true },
                "Big": { "Type": "Pass", "Result": "big", "End": true }
            }
        });
        let ctx = ExecutionContext::new(HandlerRegistry::new());

        let outcome = run(definition.clone(), &ctx, json!({ "n": 50 })).await;
        assert_eq!(outcome, Outcome::Succeeded(json!("positive")));

        let outcome = run(definition, &ctx, json!({ "n": -1 })).await;
        match outcome {
            Outcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::NoChoiceMatched),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Retry / Catch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_retry_counters_are_independent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handlers = HandlerRegistry::new().with_fn("flaky", move |_input, _ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(StatesError::custom("NetworkError", "reset")),
                    1 => Err(StatesError::custom("Error", "generic")),
                    _ => Ok(json!("ok")),
                }
            }
        });
        let ctx = ExecutionContext::new(handlers);
        let outcome = run(
            json!({
                "StartAt": "T",
                "States": {
                    "T": {
                        "Type": "Task",
                        "Resource": "flaky",
                        "Retry": [
                            { "ErrorEquals": ["NetworkError"], "MaxAttempts": 2, "IntervalSeconds": 0 },
                            { "ErrorEquals": ["Error"], "MaxAttempts": 2, "IntervalSeconds": 0 }
                        ],
                        "End": true
                    }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!("ok")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_then_catch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handlers = HandlerRegistry::new().with_fn("broken", move |_input, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(StatesError::custom("Boom", "always")) }
        });
        let ctx = ExecutionContext::new(handlers);
        let outcome = run(
            json!({
                "StartAt": "T",
                "States": {
                    "T": {
                        "Type": "Task",
                        "Resource": "broken",
                        "Retry": [{ "ErrorEquals": ["Boom"], "MaxAttempts": 2, "IntervalSeconds": 0 }],
                        "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Handled" }],
                        "Next": "Unreached"
                    },
                    "Handled": { "Type": "Pass", "End": true },
                    "Unreached": { "Type": "Fail", "Error": "Wrong" }
                }
            }),
            &ctx,
            json!({ "in": 1 }),
        )
        .await;
        assert_eq!(
            outcome,
            Outcome::Succeeded(json!({ "error": { "Error": "Boom", "Cause": "always" } }))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_catch_order_first_match_wins() {
        let handlers = HandlerRegistry::new().with_fn("throw_y", |_input, _ctx| async move {
            Err(StatesError::custom("Y", "y happened"))
        });
        let ctx = ExecutionContext::new(handlers);
        let outcome = run(
            json!({
                "StartAt": "T",
                "States": {
                    "T": {
                        "Type": "Task",
                        "Resource": "throw_y",
                        "Catch": [
                            { "ErrorEquals": ["X"], "Next": "A" },
                            { "ErrorEquals": ["States.ALL"], "Next": "B", "ResultPath": "$.err" }
                        ],
                        "End": true
                    },
                    "A": { "Type": "Pass", "Result": "A", "End": true },
                    "B": { "Type": "Pass", "OutputPath": "$.err.Error", "End": true }
                }
            }),
            &ctx,
            json!({ "orig": true }),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!("Y")));
    }

    #[tokio::test]
    async fn test_uncaught_error_fails_machine() {
        let handlers = HandlerRegistry::new().with_fn("throw", |_input, _ctx| async move {
            Err(StatesError::custom("Nope", "unhandled"))
        });
        let ctx = ExecutionContext::new(handlers);
        let outcome = run(
            json!({
                "StartAt": "T",
                "States": {
                    "T": {
                        "Type": "Task",
                        "Resource": "throw",
                        "Catch": [{ "ErrorEquals": ["Other"], "Next": "Done" }],
                        "End": true
                    },
                    "Done": { "Type": "Succeed" }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;
        let (status, output) = outcome.into_parts();
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(output["Error"], json!("Nope"));
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_abort_before_start_invokes_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handlers = HandlerRegistry::new().with_fn("work", move |_input, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(json!("done")) }
        });
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ExecutionContext::builder()
            .handlers(handlers)
            .abort_token(token)
            .build();

        let outcome = run(
            json!({
                "StartAt": "T",
                "States": { "T": { "Type": "Task", "Resource": "work", "End": true } }
            }),
            &ctx,
            json!({}),
        )
        .await;
        let (status, output) = outcome.into_parts();
        assert_eq!(status, ExecutionStatus::Failed);
        assert!(output["Cause"].as_str().unwrap().contains("aborted"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_abort_mid_task_bypasses_catch() {
        let handlers = HandlerRegistry::new().with_fn("slow", |_input, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!("late"))
        });
        let token = CancellationToken::new();
        let ctx = ExecutionContext::builder()
            .handlers(handlers)
            .abort_token(token.clone())
            .build();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let outcome = run(
            json!({
                "StartAt": "T",
                "States": {
                    "T": {
                        "Type": "Task",
                        "Resource": "slow",
                        "Retry": [{ "ErrorEquals": ["States.ALL"], "IntervalSeconds": 0 }],
                        "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Caught" }],
                        "End": true
                    },
                    "Caught": { "Type": "Succeed" }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;
        match outcome {
            Outcome::Failed(e) => assert!(e.is_aborted()),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_collects_in_branch_order() {
        let handlers = HandlerRegistry::new().with_fn("delay", |input, _ctx| async move {
            let ms = input["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(input["tag"].clone())
        });
        let ctx = ExecutionContext::new(handlers);
        let branch = |tag: &str, ms: u64| {
            json!({
                "StartAt": "T",
                "States": {
                    "T": {
                        "Type": "Task",
                        "Resource": "delay",
                        "Parameters": { "tag": tag, "ms": ms },
                        "End": true
                    }
                }
            })
        };
        let outcome = run(
            json!({
                "StartAt": "P",
                "States": {
                    "P": {
                        "Type": "Parallel",
                        "Branches": [branch("slow", 40), branch("fast", 1)],
                        "End": true
                    }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!(["slow", "fast"])));
    }

    #[tokio::test]
    async fn test_parallel_branch_failure_is_branch_failed() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let outcome = run(
            json!({
                "StartAt": "P",
                "States": {
                    "P": {
                        "Type": "Parallel",
                        "Branches": [
                            { "StartAt": "Ok", "States": { "Ok": { "Type": "Pass", "End": true } } },
                            { "StartAt": "Bad", "States": { "Bad": { "Type": "Fail", "Error": "Inner", "Cause": "deep" } } }
                        ],
                        "Catch": [{ "ErrorEquals": ["States.BranchFailed"], "Next": "Recovered" }],
                        "End": true
                    },
                    "Recovered": { "Type": "Pass", "OutputPath": "$.error", "End": true }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;
        let output = outcome.into_result().unwrap();
        assert_eq!(output["Error"], json!("States.BranchFailed"));
        assert!(output["Cause"].as_str().unwrap().contains("Inner: deep"));
    }

    #[tokio::test]
    async fn test_abort_mid_parallel_stops_branches() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = started.clone();
        let handlers = HandlerRegistry::new().with_fn("slow", move |_input, _ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("late"))
            }
        });
        let token = CancellationToken::new();
        let ctx = ExecutionContext::builder()
            .handlers(handlers)
            .abort_token(token.clone())
            .build();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let branch = json!({
            "StartAt": "T",
            "States": { "T": { "Type": "Task", "Resource": "slow", "End": true } }
        });
        let started_at = std::time::Instant::now();
        let outcome = run(
            json!({
                "StartAt": "P",
                "States": {
                    "P": {
                        "Type": "Parallel",
                        "Branches": [branch.clone(), branch],
                        "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Caught" }],
                        "End": true
                    },
                    "Caught": { "Type": "Succeed" }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;

        match outcome {
            Outcome::Failed(e) => assert!(e.is_aborted(), "expected abort, got {e:?}"),
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(started_at.elapsed() < Duration::from_secs(5));
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    // -----------------------------------------------------------------------
    // Validation / logging
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_invalid_definition_never_runs() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let result = execute(
            &def(json!({
                "StartAt": "Missing",
                "States": { "A": { "Type": "Pass", "End": true } }
            })),
            &ctx,
            json!({}),
        )
        .await;
        assert!(matches!(result, Err(DefinitionError::Validation(_))));
    }

    #[test]
    fn test_parse_definition_errors() {
        assert!(matches!(
            parse_definition("{ not json"),
            Err(DefinitionError::Parse(_))
        ));
        let parsed = parse_definition(
            r#"{"StartAt":"A","States":{"A":{"Type":"Succeed"}}}"#,
        )
        .unwrap();
        assert_eq!(parsed.start_at, "A");
    }

    #[tokio::test]
    async fn test_log_sink_sees_lifecycle_and_effects() {
        let sink = Arc::new(Recording::default());
        let ctx = ExecutionContext::builder()
            .handlers(HandlerRegistry::new())
            .log_sink(sink.clone())
            .build();
        run(
            json!({
                "StartAt": "A",
                "States": { "A": { "Type": "Pass", "End": true } }
            }),
            &ctx,
            json!({}),
        )
        .await;

        let events: Vec<String> = sink.0.lock().unwrap().iter().map(|(_, e)| e.clone()).collect();
        assert_eq!(events.first().map(String::as_str), Some("MachineStarted"));
        assert_eq!(events.last().map(String::as_str), Some("MachineSucceeded"));
        for effect in ["Initialize", "SelectInput", "PlaceResult", "SelectOutput"] {
            assert!(events.iter().any(|e| e == effect), "missing {effect}");
        }
    }

    #[tokio::test]
    async fn test_lifecycle_events_carry_state_type() {
        let sink = Arc::new(Recording::default());
        let ctx = ExecutionContext::builder()
            .handlers(HandlerRegistry::new())
            .log_sink(sink.clone())
            .build();
        run(
            json!({
                "StartAt": "A",
                "States": {
                    "A": { "Type": "Pass", "Next": "B" },
                    "B": { "Type": "Fail", "Error": "Stop" }
                }
            }),
            &ctx,
            json!({}),
        )
        .await;

        let events = sink.0.lock().unwrap();
        let find = |name: &str| {
            events
                .iter()
                .find(|(_, e)| e == name)
                .map(|(meta, _)| meta.clone())
                .unwrap()
        };
        let started = find("MachineStarted");
        assert_eq!(started.state, "A");
        assert_eq!(started.state_type, Some(StateType::Pass));
        let failed = find("MachineFailed");
        assert_eq!(failed.state, "B");
        assert_eq!(failed.state_type, Some(StateType::Fail));
    }

    #[tokio::test]
    async fn test_quiet_mode_same_result_no_logs() {
        let sink = Arc::new(Recording::default());
        let ctx = ExecutionContext::builder()
            .log_sink(sink.clone())
            .quiet(true)
            .build();
        let outcome = run(
            json!({
                "StartAt": "A",
                "States": { "A": { "Type": "Pass", "Result": 1, "End": true } }
            }),
            &ctx,
            json!({}),
        )
        .await;
        assert_eq!(outcome, Outcome::Succeeded(json!(1)));
        assert!(sink.0.lock().unwrap().is_empty());
    }
}
