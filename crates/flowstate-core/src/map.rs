//! Map state engine.
//!
//! Resolves the item list (from `ItemsPath` or an `ItemReader` handler),
//! optionally regroups it with an `ItemBatcher`, then runs the
//! `ItemProcessor` machine once per item on a bounded pool. Failed items
//! become `{"error": {...}}` entries at their index until the failure
//! tolerance is exceeded, at which point the pool stops admitting work and
//! the state fails with `States.ExceedToleratedFailureThreshold`.

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::{Map, Value, json};

use flowstate_types::{ErrorKind, ItemBatcher, MapState, ResourceRef, StatesError};

use crate::context::MapScope;
use crate::dataflow;
use crate::effect::{Effect, StepExecutor, aborted};
use crate::machine::run_machine;

// ---------------------------------------------------------------------------
// Failure tolerance
// ---------------------------------------------------------------------------

/// Resolved `ToleratedFailureCount` / `ToleratedFailurePercentage`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FailureTolerance {
    pub count: Option<u64>,
    pub percentage: Option<f64>,
}

impl FailureTolerance {
    /// Whether `failures` out of `total` items exceeds either bound.
    ///
    /// With neither bound set no failure is tolerated. Each bound is checked
    /// on its own and must be strictly exceeded.
    pub fn is_exceeded(&self, failures: usize, total: usize) -> bool {
        if self.count.is_none() && self.percentage.is_none() {
            return failures > 0;
        }
        let over_count = self.count.is_some_and(|c| failures as u64 > c);
        let over_percentage = self.percentage.is_some_and(|p| {
            total > 0 && (failures as f64 * 100.0 / total as f64) > p
        });
        over_count || over_percentage
    }
}

// ---------------------------------------------------------------------------
// run_map
// ---------------------------------------------------------------------------

pub(crate) async fn run_map(
    exec: &StepExecutor<'_>,
    map: &MapState,
    input: &Value,
) -> Result<Value, StatesError> {
    let items = resolve_items(exec, map, input).await?;
    let items = match &map.item_batcher {
        Some(batcher) => batch_items(exec, batcher, items, input).await?,
        None => items,
    };
    let limit = concurrency_limit(exec, map, input)?;
    let tolerance = failure_tolerance(exec, map, input)?;

    tracing::debug!(
        state = %exec.meta().state,
        items = items.len(),
        limit = ?limit,
        "map started"
    );

    let results = run_items(exec, map, input, items, limit, tolerance).await?;

    match &map.result_writer {
        Some(writer) => write_results(exec, writer, results).await,
        None => Ok(Value::Array(results)),
    }
}

/// Build a handler input from an optional `Parameters` template.
fn resource_input(
    exec: &StepExecutor<'_>,
    resource: &ResourceRef,
    data: &Value,
) -> Result<Value, StatesError> {
    match &resource.parameters {
        Some(template) => dataflow::apply_template(
            template,
            data,
            exec.context_value(),
            exec.intrinsics(),
        ),
        None => Ok(data.clone()),
    }
}

/// Invoke `resource`, wrapping any non-abort failure as `kind`.
async fn invoke_as(
    exec: &StepExecutor<'_>,
    resource: &str,
    input: Value,
    kind: ErrorKind,
) -> Result<Value, StatesError> {
    exec.perform(Effect::Invoke {
        resource,
        input,
        timeout: None,
    })
    .await
    .map_err(|err| {
        if err.is_aborted() {
            err
        } else {
            StatesError::new(kind, format!("'{resource}' failed: {err}")).with_source(err)
        }
    })
}

async fn resolve_items(
    exec: &StepExecutor<'_>,
    map: &MapState,
    input: &Value,
) -> Result<Vec<Value>, StatesError> {
    if let Some(reader) = &map.item_reader {
        let reader_input = resource_input(exec, reader, input)?;
        let value =
            invoke_as(exec, &reader.resource, reader_input, ErrorKind::ItemReaderFailed).await?;
        return match value {
            Value::Array(items) => Ok(items),
            other => Err(StatesError::new(
                ErrorKind::ItemReaderFailed,
                format!("'{}' returned {} instead of a list", reader.resource, kind_of(&other)),
            )),
        };
    }

    let path = map.items_path.as_deref().unwrap_or("$");
    match dataflow::query(path, input, exec.context_value(), ErrorKind::ParameterPathFailure)? {
        Value::Array(items) => Ok(items),
        other => Err(StatesError::new(
            ErrorKind::ParameterPathFailure,
            format!("ItemsPath '{path}' selected {} instead of a list", kind_of(&other)),
        )),
    }
}

async fn batch_items(
    exec: &StepExecutor<'_>,
    batcher: &ItemBatcher,
    items: Vec<Value>,
    input: &Value,
) -> Result<Vec<Value>, StatesError> {
    let batch_input = match &batcher.batch_input {
        Some(template) => Some(dataflow::apply_template(
            template,
            input,
            exec.context_value(),
            exec.intrinsics(),
        )?),
        None => None,
    };

    if let Some(resource) = &batcher.resource {
        let mut payload = Map::new();
        payload.insert("Items".into(), Value::Array(items));
        payload.insert("BatchInput".into(), batch_input.unwrap_or(Value::Null));
        let value = invoke_as(
            exec,
            resource,
            Value::Object(payload),
            ErrorKind::ItemReaderFailed,
        )
        .await?;
        return match value {
            Value::Array(batches) => Ok(batches),
            other => Err(StatesError::new(
                ErrorKind::ItemReaderFailed,
                format!("batcher '{resource}' returned {} instead of a list", kind_of(&other)),
            )),
        };
    }

    let size = batcher.max_items_per_batch.unwrap_or(1).max(1);
    Ok(items
        .chunks(size)
        .map(|chunk| {
            let mut batch = Map::new();
            batch.insert("Items".into(), Value::Array(chunk.to_vec()));
            if let Some(bi) = &batch_input {
                batch.insert("BatchInput".into(), bi.clone());
            }
            Value::Object(batch)
        })
        .collect())
}

/// `None` means unbounded.
fn concurrency_limit(
    exec: &StepExecutor<'_>,
    map: &MapState,
    input: &Value,
) -> Result<Option<usize>, StatesError> {
    let configured = match (&map.max_concurrency, &map.max_concurrency_path) {
        (Some(n), _) => Some(*n as usize),
        (None, Some(path)) => Some(non_negative(exec, path, input, "MaxConcurrencyPath")? as usize),
        (None, None) => exec.ctx().config().default_max_concurrency,
    };
    Ok(configured.filter(|n| *n > 0))
}

fn failure_tolerance(
    exec: &StepExecutor<'_>,
    map: &MapState,
    input: &Value,
) -> Result<FailureTolerance, StatesError> {
    let count = match (&map.tolerated_failure_count, &map.tolerated_failure_count_path) {
        (Some(n), _) => Some(*n),
        (None, Some(path)) => Some(non_negative(exec, path, input, "ToleratedFailureCountPath")?),
        (None, None) => None,
    };
    let percentage = match (
        &map.tolerated_failure_percentage,
        &map.tolerated_failure_percentage_path,
    ) {
        (Some(p), _) => Some(*p),
        (None, Some(path)) => {
            let value = dataflow::query(
                path,
                input,
                exec.context_value(),
                ErrorKind::QueryEvaluationError,
            )?;
            let p = value
                .as_f64()
                .filter(|p| (0.0..=100.0).contains(p))
                .ok_or_else(|| {
                    StatesError::new(
                        ErrorKind::QueryEvaluationError,
                        format!("ToleratedFailurePercentagePath '{path}' must select 0..=100"),
                    )
                })?;
            Some(p)
        }
        (None, None) => None,
    };
    Ok(FailureTolerance { count, percentage })
}

fn non_negative(
    exec: &StepExecutor<'_>,
    path: &str,
    input: &Value,
    field: &str,
) -> Result<u64, StatesError> {
    dataflow::query(
        path,
        input,
        exec.context_value(),
        ErrorKind::QueryEvaluationError,
    )?
    .as_u64()
    .ok_or_else(|| {
        StatesError::new(
            ErrorKind::QueryEvaluationError,
            format!("{field} '{path}' must select a non-negative integer"),
        )
    })
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

async fn run_items(
    exec: &StepExecutor<'_>,
    map: &MapState,
    input: &Value,
    items: Vec<Value>,
    limit: Option<usize>,
    tolerance: FailureTolerance,
) -> Result<Vec<Value>, StatesError> {
    let total = items.len();
    let limit = limit.unwrap_or(total).max(1);
    let parent = exec
        .ctx()
        .map_scope()
        .map(|scope| scope.value.clone())
        .unwrap_or_else(|| input.clone());
    let token = exec.ctx().abort_token();

    let mut results = vec![Value::Null; total];
    let mut failures = 0usize;
    let mut queue = items.into_iter().enumerate();
    let mut in_flight = FuturesUnordered::new();

    loop {
        if exec.ctx().is_aborted() {
            return Err(StatesError::aborted());
        }
        while in_flight.len() < limit {
            let Some((index, item)) = queue.next() else {
                break;
            };
            in_flight.push(run_item(exec, map, input, index, item, parent.clone()));
        }

        let next = tokio::select! {
            biased;
            _ = aborted(token.as_ref()) => return Err(StatesError::aborted()),
            next = in_flight.next() => next,
        };
        let Some((index, result)) = next else {
            break;
        };

        match result {
            Ok(value) => results[index] = value,
            Err(err) if err.is_aborted() => return Err(err),
            Err(err) => {
                failures += 1;
                results[index] = json!({ "error": err.to_value() });
                if tolerance.is_exceeded(failures, total) {
                    tracing::warn!(
                        state = %exec.meta().state,
                        failures,
                        total,
                        "map failure tolerance exceeded"
                    );
                    return Err(StatesError::new(
                        ErrorKind::ExceedToleratedFailureThreshold,
                        format!("{failures} of {total} items failed; last: {err}"),
                    )
                    .with_source(err));
                }
            }
        }
    }

    Ok(results)
}

async fn run_item(
    exec: &StepExecutor<'_>,
    map: &MapState,
    input: &Value,
    index: usize,
    item: Value,
    parent: Value,
) -> (usize, Result<Value, StatesError>) {
    let child = exec
        .ctx()
        .derive()
        .map_scope(MapScope {
            value: item.clone(),
            index,
            parent,
        })
        .build();

    let item_input = match &map.item_selector {
        Some(template) => {
            let context = exec.context_value_for(&child);
            let selected = exec
                .perform(Effect::SelectItem {
                    template,
                    input,
                    context: &context,
                })
                .await;
            match selected {
                Ok(value) => value,
                Err(err) => return (index, Err(err)),
            }
        }
        None => item,
    };

    let outcome = run_machine(&map.item_processor, &child, item_input).await;
    (index, outcome.into_result())
}

async fn write_results(
    exec: &StepExecutor<'_>,
    writer: &ResourceRef,
    results: Vec<Value>,
) -> Result<Value, StatesError> {
    let data = Value::Array(results);
    let writer_input = resource_input(exec, writer, &data)?;
    invoke_as(exec, &writer.resource, writer_input, ErrorKind::ResultWriterFailed).await
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
