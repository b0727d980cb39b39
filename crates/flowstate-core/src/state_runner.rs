//! Per-type state actions.
//!
//! `run_action` is step 4 of the pipeline: it receives the effective
//! (parameterized) input and produces the raw result, plus a transition
//! override for Choice states.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;

use flowstate_types::{
    ErrorKind, FailState, ParallelState, State, StateKind, StatesError, TaskState, WaitState,
};

use crate::choice::find_choice;
use crate::dataflow;
use crate::effect::{Effect, StepExecutor, aborted};
use crate::machine::{Outcome, run_machine};
use crate::map::run_map;

/// Raw result of a state's action.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ActionOutput {
    pub value: Value,
    /// Transition target chosen by the action itself (Choice).
    pub next: Option<String>,
}

impl ActionOutput {
    fn value(value: Value) -> Self {
        Self { value, next: None }
    }
}

pub(crate) async fn run_action(
    exec: &StepExecutor<'_>,
    state: &State,
    input: &Value,
) -> Result<ActionOutput, StatesError> {
    match &state.kind {
        StateKind::Pass(pass) => Ok(ActionOutput::value(
            pass.result.clone().unwrap_or_else(|| input.clone()),
        )),
        StateKind::Task(task) => run_task(exec, task, input).await.map(ActionOutput::value),
        StateKind::Choice(choice) => {
            let next = find_choice(&choice.choices, input, exec.context_value())
                .and_then(|rule| rule.next.clone())
                .or_else(|| choice.default.clone())
                .ok_or_else(|| {
                    StatesError::new(
                        ErrorKind::NoChoiceMatched,
                        format!("no choice rule matched in state '{}'", exec.meta().state),
                    )
                })?;
            Ok(ActionOutput {
                value: input.clone(),
                next: Some(next),
            })
        }
        StateKind::Wait(wait) => {
            let duration = wait_duration(exec, wait, input)?;
            exec.perform(Effect::Wait { duration }).await?;
            Ok(ActionOutput::value(input.clone()))
        }
        StateKind::Succeed => Ok(ActionOutput::value(input.clone())),
        StateKind::Fail(fail) => Err(fail_error(fail)),
        StateKind::Parallel(parallel) => run_parallel(exec, parallel, input)
            .await
            .map(ActionOutput::value),
        StateKind::Map(map) => run_map(exec, map, input).await.map(ActionOutput::value),
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

async fn run_task(
    exec: &StepExecutor<'_>,
    task: &TaskState,
    input: &Value,
) -> Result<Value, StatesError> {
    let timeout = match (&task.timeout_seconds, &task.timeout_seconds_path) {
        (Some(secs), _) => Some(seconds(*secs, "TimeoutSeconds")?),
        (None, Some(path)) => {
            let value = dataflow::query(
                path,
                input,
                exec.context_value(),
                ErrorKind::QueryEvaluationError,
            )?;
            let secs = value.as_f64().filter(|s| *s > 0.0).ok_or_else(|| {
                StatesError::new(
                    ErrorKind::QueryEvaluationError,
                    format!("TimeoutSecondsPath '{path}' must select a positive number"),
                )
            })?;
            Some(seconds(secs, "TimeoutSecondsPath")?)
        }
        (None, None) => None,
    };

    exec.perform(Effect::Invoke {
        resource: &task.resource,
        input: input.clone(),
        timeout,
    })
    .await
}

fn seconds(secs: f64, field: &str) -> Result<Duration, StatesError> {
    Duration::try_from_secs_f64(secs.max(0.0)).map_err(|e| {
        StatesError::new(
            ErrorKind::QueryEvaluationError,
            format!("{field} is not a valid duration: {e}"),
        )
    })
}

// ---------------------------------------------------------------------------
// Wait
// ---------------------------------------------------------------------------

fn wait_duration(
    exec: &StepExecutor<'_>,
    wait: &WaitState,
    input: &Value,
) -> Result<Duration, StatesError> {
    let query = |path: &str| {
        dataflow::query(
            path,
            input,
            exec.context_value(),
            ErrorKind::QueryEvaluationError,
        )
    };
    let type_error = |field: &str, expected: &str| {
        StatesError::new(
            ErrorKind::QueryEvaluationError,
            format!("{field} must select {expected}"),
        )
    };

    if let Some(secs) = wait.seconds {
        return seconds(secs, "Seconds");
    }
    if let Some(path) = &wait.seconds_path {
        let secs = query(path)?
            .as_f64()
            .ok_or_else(|| type_error("SecondsPath", "a number"))?;
        return seconds(secs, "SecondsPath");
    }
    if let Some(ts) = &wait.timestamp {
        return until(ts, "Timestamp");
    }
    if let Some(path) = &wait.timestamp_path {
        let value = query(path)?;
        let ts = value
            .as_str()
            .ok_or_else(|| type_error("TimestampPath", "a timestamp string"))?;
        return until(ts, "TimestampPath");
    }
    Ok(Duration::ZERO)
}

/// Time from now until an RFC 3339 timestamp, zero if it is in the past.
fn until(timestamp: &str, field: &str) -> Result<Duration, StatesError> {
    let target = DateTime::parse_from_rfc3339(timestamp).map_err(|e| {
        StatesError::new(
            ErrorKind::QueryEvaluationError,
            format!("{field} '{timestamp}' is not an RFC 3339 timestamp: {e}"),
        )
        .with_source(e)
    })?;
    Ok((target.with_timezone(&Utc) - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO))
}

// ---------------------------------------------------------------------------
// Fail
// ---------------------------------------------------------------------------

fn fail_error(fail: &FailState) -> StatesError {
    let cause = fail.cause.clone().unwrap_or_default();
    match &fail.error {
        Some(name) => StatesError::custom(name.clone(), cause),
        None => StatesError::new(ErrorKind::Runtime, cause),
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

/// Run every branch concurrently on the same input. The first branch failure
/// fails the state with `States.BranchFailed`; outputs keep branch order.
async fn run_parallel(
    exec: &StepExecutor<'_>,
    parallel: &ParallelState,
    input: &Value,
) -> Result<Value, StatesError> {
    let ctx = exec.ctx();
    let children: Vec<_> = parallel.branches.iter().map(|_| ctx.derive().build()).collect();

    let mut pending: FuturesUnordered<_> = parallel
        .branches
        .iter()
        .zip(children.iter())
        .enumerate()
        .map(|(index, (branch, child))| {
            let input = input.clone();
            async move { (index, run_machine(branch, child, input).await) }
        })
        .collect();

    let token = ctx.abort_token();
    let mut outputs = vec![Value::Null; parallel.branches.len()];
    loop {
        let next = tokio::select! {
            biased;
            _ = aborted(token.as_ref()) => return Err(StatesError::aborted()),
            next = pending.next() => next,
        };
        match next {
            None => break,
            Some((index, Outcome::Succeeded(value))) => outputs[index] = value,
            Some((_, Outcome::Failed(err))) if err.is_aborted() => return Err(err),
            Some((index, Outcome::Failed(err))) => {
                tracing::debug!(
                    state = %exec.meta().state,
                    branch = index,
                    error = err.name(),
                    "parallel branch failed"
                );
                return Err(StatesError::new(
                    ErrorKind::BranchFailed,
                    format!("branch {index} failed: {err}"),
                )
                .with_details(err.to_value())
                .with_source(err));
            }
        }
    }
    Ok(Value::Array(outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::context::ExecutionContext;
    use crate::handler::HandlerRegistry;
    use flowstate_types::{PassState, StateType};

    fn wait_state(wait: WaitState) -> State {
        State::new(StateKind::Wait(wait))
    }

    #[test]
    fn test_wait_duration_sources() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let exec = StepExecutor::new(&ctx, "W", StateType::Wait);
        let input = json!({ "secs": 2, "when": "2000-01-01T00:00:00Z" });

        let d = wait_duration(
            &exec,
            &WaitState {
                seconds: Some(1.5),
                ..WaitState::default()
            },
            &input,
        )
        .unwrap();
        assert_eq!(d, Duration::from_millis(1500));

        let d = wait_duration(
            &exec,
            &WaitState {
                seconds_path: Some("$.secs".into()),
                ..WaitState::default()
            },
            &input,
        )
        .unwrap();
        assert_eq!(d, Duration::from_secs(2));

        let d = wait_duration(
            &exec,
            &WaitState {
                timestamp_path: Some("$.when".into()),
                ..WaitState::default()
            },
            &input,
        )
        .unwrap();
        assert_eq!(d, Duration::ZERO);

        let err = wait_duration(
            &exec,
            &WaitState {
                timestamp: Some("yesterday".into()),
                ..WaitState::default()
            },
            &input,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryEvaluationError);
    }

    #[tokio::test]
    async fn test_wait_state_passes_input_through() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let exec = StepExecutor::new(&ctx, "W", StateType::Wait);
        let state = wait_state(WaitState {
            seconds: Some(0.0),
            ..WaitState::default()
        });
        let out = run_action(&exec, &state, &json!({ "a": 1 })).await.unwrap();
        assert_eq!(out.value, json!({ "a": 1 }));
        assert_eq!(out.next, None);
    }

    #[tokio::test]
    async fn test_pass_action() {
        let ctx = ExecutionContext::new(HandlerRegistry::new());
        let exec = StepExecutor::new(&ctx, "P", StateType::Pass);
        let state = State::new(StateKind::Pass(PassState {
            result: Some(json!("fixed")),
        }));
        let out = run_action(&exec, &state, &json!({})).await.unwrap();
        assert_eq!(out.value, json!("fixed"));
    }

    #[test]
    fn test_fail_error_names() {
        let err = fail_error(&FailState {
            error: Some("Custom".into()),
            cause: Some("why".into()),
        });
        assert_eq!(err.name(), "Custom");
        assert_eq!(err.message(), "why");
        assert_eq!(fail_error(&FailState::default()).kind(), ErrorKind::Runtime);
    }

    #[tokio::test]
    async fn test_task_timeout_path() {
        let handlers = HandlerRegistry::new().with_fn("slow", |_input, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let ctx = ExecutionContext::new(handlers);
        let exec = StepExecutor::new(&ctx, "T", StateType::Task);
        let task = TaskState {
            resource: "slow".into(),
            timeout_seconds: None,
            timeout_seconds_path: Some("$.limit".into()),
        };
        let err = run_task(&exec, &task, &json!({ "limit": 0.02 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let err = run_task(&exec, &task, &json!({ "limit": "soon" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryEvaluationError);
    }
}
