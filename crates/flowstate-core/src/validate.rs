//! Structural validation of machine definitions.
//!
//! Runs before any state executes. Every problem found is collected and
//! reported together, each prefixed with its location (`States.A.Next`,
//! `States.M.ItemProcessor.States.B`, ...).

use regex::Regex;
use serde_json::Value;

use flowstate_types::{
    ChoiceRule, DefinitionError, MachineDefinition, MapState, RetryRule, State, StateKind,
    TaskState, WaitState,
};

use crate::choice::parse_operator;
use crate::dataflow::EXPRESSION_SUFFIX;
use crate::intrinsic::IntrinsicResolver;
use crate::path::{JsonPath, PathRoot};

/// Validate structural constraints on a `MachineDefinition`.
///
/// Checks:
/// - `States` is non-empty and `StartAt` names one of them
/// - every `Next`, `Default` and `Catch[].Next` target exists
/// - non-terminal states other than Choice set exactly one of `Next`/`End`
/// - Choice has at least one rule and every rule is well-formed
/// - paths parse, and `ResultPath` is a definite path on the data root
/// - Retry parameters are in range
/// - Wait sets exactly one duration source
/// - Parallel has branches and Map percentages are within 0..=100
/// - nested definitions pass the same checks
pub fn validate_definition(def: &MachineDefinition) -> Result<(), DefinitionError> {
    let mut problems = Vec::new();
    check_machine(def, "", &mut problems);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(DefinitionError::Validation(problems.join("; ")))
    }
}

fn check_machine(def: &MachineDefinition, prefix: &str, problems: &mut Vec<String>) {
    if def.states.is_empty() {
        problems.push(format!("{prefix}States must not be empty"));
        return;
    }
    if !def.states.contains_key(&def.start_at) {
        problems.push(format!(
            "{prefix}StartAt '{}' is not a state",
            def.start_at
        ));
    }
    for (key, state) in &def.states {
        let location = format!("{prefix}States.{key}");
        check_state(def, state, &location, problems);
    }
}

fn check_target(
    def: &MachineDefinition,
    target: &str,
    location: &str,
    field: &str,
    problems: &mut Vec<String>,
) {
    if !def.states.contains_key(target) {
        problems.push(format!("{location}.{field} '{target}' is not a state"));
    }
}

fn check_state(def: &MachineDefinition, state: &State, location: &str, problems: &mut Vec<String>) {
    match &state.kind {
        StateKind::Choice(_) => {
            if state.next.is_some() || state.end {
                problems.push(format!("{location}: Choice states cannot set Next or End"));
            }
        }
        StateKind::Succeed | StateKind::Fail(_) => {
            if state.next.is_some() {
                problems.push(format!("{location}: terminal states cannot set Next"));
            }
        }
        _ => match (&state.next, state.end) {
            (Some(_), true) => problems.push(format!("{location}: Next and End are exclusive")),
            (None, false) => problems.push(format!("{location}: one of Next or End is required")),
            _ => {}
        },
    }

    if let Some(next) = &state.next {
        check_target(def, next, location, "Next", problems);
    }
    for (i, catcher) in state.catch.iter().enumerate() {
        check_target(def, &catcher.next, location, &format!("Catch[{i}].Next"), problems);
        if catcher.error_equals.is_empty() {
            problems.push(format!("{location}.Catch[{i}].ErrorEquals must not be empty"));
        }
        check_result_path(&catcher.result_path, &format!("{location}.Catch[{i}]"), problems);
    }
    for (i, rule) in state.retry.iter().enumerate() {
        check_retry(rule, &format!("{location}.Retry[{i}]"), problems);
    }

    check_optional_path(&state.input_path, location, "InputPath", problems);
    check_optional_path(&state.output_path, location, "OutputPath", problems);
    check_result_path(&state.result_path, location, problems);
    if let Some(template) = &state.parameters {
        check_template(template, &format!("{location}.Parameters"), problems);
    }
    if let Some(template) = &state.result_selector {
        check_template(template, &format!("{location}.ResultSelector"), problems);
    }

    match &state.kind {
        StateKind::Task(task) => check_task(task, location, problems),
        StateKind::Choice(choice) => {
            if choice.choices.is_empty() {
                problems.push(format!("{location}.Choices must not be empty"));
            }
            for (i, rule) in choice.choices.iter().enumerate() {
                let rule_location = format!("{location}.Choices[{i}]");
                match &rule.next {
                    Some(next) => check_target(def, next, &rule_location, "Next", problems),
                    None => problems.push(format!("{rule_location}: Next is required")),
                }
                check_rule(rule, &rule_location, problems);
            }
            if let Some(default) = &choice.default {
                check_target(def, default, location, "Default", problems);
            }
        }
        StateKind::Wait(wait) => check_wait(wait, location, problems),
        StateKind::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                problems.push(format!("{location}.Branches must not be empty"));
            }
            for (i, branch) in parallel.branches.iter().enumerate() {
                check_machine(branch, &format!("{location}.Branches[{i}]."), problems);
            }
        }
        StateKind::Map(map) => check_map(map, location, problems),
        StateKind::Pass(_) | StateKind::Succeed | StateKind::Fail(_) => {}
    }
}

// ---------------------------------------------------------------------------
// Paths and templates
// ---------------------------------------------------------------------------

fn check_path(path: &str, location: &str, field: &str, problems: &mut Vec<String>) {
    if let Err(e) = JsonPath::parse(path) {
        problems.push(format!("{location}.{field}: {e}"));
    }
}

fn check_optional_path(
    path: &Option<Option<String>>,
    location: &str,
    field: &str,
    problems: &mut Vec<String>,
) {
    if let Some(Some(path)) = path {
        check_path(path, location, field, problems);
    }
}

fn check_result_path(path: &Option<Option<String>>, location: &str, problems: &mut Vec<String>) {
    let Some(Some(path)) = path else {
        return;
    };
    match JsonPath::parse(path) {
        Err(e) => problems.push(format!("{location}.ResultPath: {e}")),
        Ok(parsed) if parsed.root() == PathRoot::Context => problems.push(format!(
            "{location}.ResultPath '{path}' cannot target the context object"
        )),
        Ok(parsed) if !parsed.is_definite() => problems.push(format!(
            "{location}.ResultPath '{path}' must be a definite path"
        )),
        Ok(_) => {}
    }
}

/// Check the syntax of every `key.$` path in a template. Intrinsic calls are
/// only checked at run time.
fn check_template(template: &Value, location: &str, problems: &mut Vec<String>) {
    match template {
        Value::Object(fields) => {
            for (key, value) in fields {
                match (key.strip_suffix(EXPRESSION_SUFFIX), value) {
                    (Some(_), Value::String(expr)) => {
                        if !IntrinsicResolver::is_intrinsic(expr) {
                            check_path(expr, location, key, problems);
                        }
                    }
                    (Some(_), _) => problems.push(format!(
                        "{location}.{key}: expression fields must hold a string"
                    )),
                    (None, nested) => check_template(nested, &format!("{location}.{key}"), problems),
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_template(item, &format!("{location}[{i}]"), problems);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Per-type checks
// ---------------------------------------------------------------------------

fn check_retry(rule: &RetryRule, location: &str, problems: &mut Vec<String>) {
    if rule.error_equals.is_empty() {
        problems.push(format!("{location}.ErrorEquals must not be empty"));
    }
    if rule.interval_seconds.is_nan() || rule.interval_seconds < 0.0 {
        problems.push(format!("{location}.IntervalSeconds must be >= 0"));
    }
    if rule.backoff_rate.is_nan() || rule.backoff_rate < 1.0 {
        problems.push(format!("{location}.BackoffRate must be >= 1"));
    }
    if rule
        .max_delay_seconds
        .is_some_and(|max| max.is_nan() || max <= 0.0)
    {
        problems.push(format!("{location}.MaxDelaySeconds must be > 0"));
    }
}

fn check_task(task: &TaskState, location: &str, problems: &mut Vec<String>) {
    if task.resource.is_empty() {
        problems.push(format!("{location}.Resource must not be empty"));
    }
    if task.timeout_seconds.is_some() && task.timeout_seconds_path.is_some() {
        problems.push(format!(
            "{location}: TimeoutSeconds and TimeoutSecondsPath are exclusive"
        ));
    }
    if task
        .timeout_seconds
        .is_some_and(|secs| secs.is_nan() || secs <= 0.0)
    {
        problems.push(format!("{location}.TimeoutSeconds must be > 0"));
    }
    if let Some(path) = &task.timeout_seconds_path {
        check_path(path, location, "TimeoutSecondsPath", problems);
    }
}

fn check_wait(wait: &WaitState, location: &str, problems: &mut Vec<String>) {
    let sources = [
        wait.seconds.is_some(),
        wait.seconds_path.is_some(),
        wait.timestamp.is_some(),
        wait.timestamp_path.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if sources != 1 {
        problems.push(format!(
            "{location}: exactly one of Seconds, SecondsPath, Timestamp or TimestampPath is required"
        ));
    }
    if wait.seconds.is_some_and(|secs| secs.is_nan() || secs < 0.0) {
        problems.push(format!("{location}.Seconds must be >= 0"));
    }
    if let Some(path) = &wait.seconds_path {
        check_path(path, location, "SecondsPath", problems);
    }
    if let Some(path) = &wait.timestamp_path {
        check_path(path, location, "TimestampPath", problems);
    }
}

fn check_map(map: &MapState, location: &str, problems: &mut Vec<String>) {
    if let Some(path) = &map.items_path {
        check_path(path, location, "ItemsPath", problems);
    }
    if let Some(template) = &map.item_selector {
        check_template(template, &format!("{location}.ItemSelector"), problems);
    }
    if map.max_concurrency.is_some() && map.max_concurrency_path.is_some() {
        problems.push(format!(
            "{location}: MaxConcurrency and MaxConcurrencyPath are exclusive"
        ));
    }
    if map
        .tolerated_failure_percentage
        .is_some_and(|pct| !(0.0..=100.0).contains(&pct))
    {
        problems.push(format!(
            "{location}.ToleratedFailurePercentage must be within 0..=100"
        ));
    }
    if map
        .item_batcher
        .as_ref()
        .is_some_and(|b| b.max_items_per_batch == Some(0))
    {
        problems.push(format!("{location}.ItemBatcher.MaxItemsPerBatch must be > 0"));
    }
    for (field, path) in [
        ("MaxConcurrencyPath", &map.max_concurrency_path),
        ("ToleratedFailureCountPath", &map.tolerated_failure_count_path),
        (
            "ToleratedFailurePercentagePath",
            &map.tolerated_failure_percentage_path,
        ),
    ] {
        if let Some(path) = path {
            check_path(path, location, field, problems);
        }
    }
    check_machine(
        &map.item_processor,
        &format!("{location}.ItemProcessor."),
        problems,
    );
}

/// A rule is a combinator (`And`, `Or`, `Not`) or a leaf with a `Variable`
/// and exactly one recognised operator.
fn check_rule(rule: &ChoiceRule, location: &str, problems: &mut Vec<String>) {
    let combinators = [rule.and.is_some(), rule.or.is_some(), rule.not.is_some()]
        .into_iter()
        .filter(|set| *set)
        .count();

    if combinators > 1 {
        problems.push(format!("{location}: And, Or and Not are exclusive"));
        return;
    }
    if combinators == 1 {
        if rule.variable.is_some() || !rule.operators.is_empty() {
            problems.push(format!(
                "{location}: a combinator cannot also carry Variable or an operator"
            ));
        }
        for (name, list) in [("And", &rule.and), ("Or", &rule.or)] {
            if let Some(list) = list {
                if list.is_empty() {
                    problems.push(format!("{location}.{name} must not be empty"));
                }
                for (i, nested) in list.iter().enumerate() {
                    check_rule(nested, &format!("{location}.{name}[{i}]"), problems);
                }
            }
        }
        if let Some(nested) = &rule.not {
            check_rule(nested, &format!("{location}.Not"), problems);
        }
        return;
    }

    match &rule.variable {
        Some(variable) => check_path(variable, location, "Variable", problems),
        None => problems.push(format!("{location}: Variable is required")),
    }
    match rule.operators.len() {
        0 => problems.push(format!("{location}: a comparison operator is required")),
        1 => {
            for (key, operand) in &rule.operators {
                if parse_operator(key).is_none() {
                    problems.push(format!("{location}: unknown operator '{key}'"));
                } else if key.ends_with("Path") {
                    match operand.as_str() {
                        Some(path) => check_path(path, location, key, problems),
                        None => problems.push(format!("{location}.{key} must be a path string")),
                    }
                } else if key == "StringMatches" {
                    check_pattern(operand, location, problems);
                }
            }
        }
        _ => problems.push(format!("{location}: only one comparison operator is allowed")),
    }
}

fn check_pattern(operand: &Value, location: &str, problems: &mut Vec<String>) {
    match operand.as_str() {
        Some(pattern) => {
            if let Err(e) = Regex::new(pattern) {
                problems.push(format!("{location}.StringMatches: invalid pattern: {e}"));
            }
        }
        None => problems.push(format!("{location}.StringMatches must be a string")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn def(value: Value) -> MachineDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn problems(value: Value) -> String {
        match validate_definition(&def(value)) {
            Err(DefinitionError::Validation(msg)) => msg,
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_definition_passes() {
        let definition = def(json!({
            "StartAt": "Check",
            "States": {
                "Check": {
                    "Type": "Choice",
                    "Choices": [
                        {
                            "And": [
                                { "Variable": "$.n", "NumericGreaterThan": 0 },
                                { "Not": { "Variable": "$.s", "StringEquals": "skip" } }
                            ],
                            "Next": "Work"
                        }
                    ],
                    "Default": "Done"
                },
                "Work": {
                    "Type": "Task",
                    "Resource": "work",
                    "Parameters": { "n.$": "$.n", "fmt.$": "States.Format('{}', $.n)" },
                    "ResultPath": "$.out",
                    "Retry": [{ "ErrorEquals": ["States.ALL"] }],
                    "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Done" }],
                    "Next": "Pause"
                },
                "Pause": { "Type": "Wait", "Seconds": 0, "Next": "Done" },
                "Done": { "Type": "Succeed" }
            }
        }));
        assert_eq!(validate_definition(&definition), Ok(()));
    }

    #[test]
    fn test_missing_start_and_targets() {
        let msg = problems(json!({
            "StartAt": "Nowhere",
            "States": {
                "A": {
                    "Type": "Pass",
                    "Next": "Ghost",
                    "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Phantom" }]
                }
            }
        }));
        assert!(msg.contains("StartAt 'Nowhere'"));
        assert!(msg.contains("States.A.Next 'Ghost'"));
        assert!(msg.contains("Catch[0].Next 'Phantom'"));
    }

    #[test]
    fn test_next_and_end_rules() {
        let msg = problems(json!({
            "StartAt": "A",
            "States": {
                "A": { "Type": "Pass", "Next": "B", "End": true },
                "B": { "Type": "Pass" },
                "C": { "Type": "Choice", "Choices": [], "Next": "A" }
            }
        }));
        assert!(msg.contains("States.A: Next and End are exclusive"));
        assert!(msg.contains("States.B: one of Next or End is required"));
        assert!(msg.contains("States.C: Choice states cannot set Next or End"));
        assert!(msg.contains("States.C.Choices must not be empty"));
    }

    #[test]
    fn test_choice_rule_shape() {
        let msg = problems(json!({
            "StartAt": "C",
            "States": {
                "C": {
                    "Type": "Choice",
                    "Choices": [
                        { "Variable": "$.x", "NumericEqualz": 1, "Next": "D" },
                        { "Variable": "$.x", "NumericEquals": 1 },
                        { "NumericEquals": 1, "Next": "D" },
                        { "Or": [], "Next": "D" }
                    ]
                },
                "D": { "Type": "Succeed" }
            }
        }));
        assert!(msg.contains("unknown operator 'NumericEqualz'"));
        assert!(msg.contains("Choices[1]: Next is required"));
        assert!(msg.contains("Choices[2]: Variable is required"));
        assert!(msg.contains("Choices[3].Or must not be empty"));
    }

    #[test]
    fn test_string_matches_pattern_must_compile() {
        let msg = problems(json!({
            "StartAt": "C",
            "States": {
                "C": {
                    "Type": "Choice",
                    "Choices": [
                        { "Variable": "$.s", "StringMatches": "(open", "Next": "D" },
                        { "Variable": "$.s", "StringMatches": 5, "Next": "D" },
                        { "Variable": "$.s", "StringMatches": "^ok$", "Next": "D" }
                    ]
                },
                "D": { "Type": "Succeed" }
            }
        }));
        assert!(msg.contains("Choices[0].StringMatches: invalid pattern"));
        assert!(msg.contains("Choices[1].StringMatches must be a string"));
        assert!(!msg.contains("Choices[2]"));
    }

    #[test]
    fn test_result_path_must_be_definite_data_path() {
        let msg = problems(json!({
            "StartAt": "A",
            "States": {
                "A": { "Type": "Pass", "ResultPath": "$.items[*]", "Next": "B" },
                "B": { "Type": "Pass", "ResultPath": "$$.State", "End": true }
            }
        }));
        assert!(msg.contains("must be a definite path"));
        assert!(msg.contains("cannot target the context object"));
    }

    #[test]
    fn test_null_paths_are_valid() {
        let definition = def(json!({
            "StartAt": "A",
            "States": {
                "A": { "Type": "Pass", "InputPath": null, "ResultPath": null, "OutputPath": null, "End": true }
            }
        }));
        assert!(validate_definition(&definition).is_ok());
    }

    #[test]
    fn test_retry_and_wait_ranges() {
        let msg = problems(json!({
            "StartAt": "W",
            "States": {
                "W": {
                    "Type": "Wait",
                    "Seconds": 1,
                    "TimestampPath": "$.t",
                    "Next": "T"
                },
                "T": {
                    "Type": "Task",
                    "Resource": "x",
                    "TimeoutSeconds": 0,
                    "Retry": [{ "ErrorEquals": ["E"], "BackoffRate": 0.5, "IntervalSeconds": -1 }],
                    "End": true
                }
            }
        }));
        assert!(msg.contains("exactly one of Seconds"));
        assert!(msg.contains("BackoffRate must be >= 1"));
        assert!(msg.contains("IntervalSeconds must be >= 0"));
        assert!(msg.contains("TimeoutSeconds must be > 0"));
    }

    #[test]
    fn test_nested_definitions_are_checked() {
        let msg = problems(json!({
            "StartAt": "P",
            "States": {
                "P": {
                    "Type": "Parallel",
                    "Branches": [
                        { "StartAt": "Missing", "States": { "X": { "Type": "Succeed" } } }
                    ],
                    "Next": "M"
                },
                "M": {
                    "Type": "Map",
                    "ToleratedFailurePercentage": 150,
                    "ItemProcessor": {
                        "StartAt": "I",
                        "States": { "I": { "Type": "Pass", "Next": "Gone" } }
                    },
                    "End": true
                }
            }
        }));
        assert!(msg.contains("States.P.Branches[0].StartAt 'Missing'"));
        assert!(msg.contains("States.M.ToleratedFailurePercentage must be within 0..=100"));
        assert!(msg.contains("States.M.ItemProcessor.States.I.Next 'Gone'"));
    }

    #[test]
    fn test_empty_parallel_and_bad_template_path() {
        let msg = problems(json!({
            "StartAt": "P",
            "States": {
                "P": {
                    "Type": "Parallel",
                    "Branches": [],
                    "Parameters": { "bad.$": "no-dollar" },
                    "End": true
                }
            }
        }));
        assert!(msg.contains("Branches must not be empty"));
        assert!(msg.contains("States.P.Parameters.bad.$"));
    }
}
