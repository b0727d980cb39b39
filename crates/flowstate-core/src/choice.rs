//! Choice rule evaluation.
//!
//! A rule is either a comparison leaf (`Variable` plus one operator key) or
//! an `And` / `Or` / `Not` combinator. Operators whose name ends in `Path`
//! take their right operand from a path instead of a literal. Comparisons
//! between mismatched types, and leaves whose `Variable` does not resolve,
//! evaluate to false.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde_json::Value;

use flowstate_types::ChoiceRule;

use crate::path::{JsonPath, PathRoot};

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Domain {
    String,
    Numeric,
    Boolean,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Comparison {
    Equals,
    LessThan,
    GreaterThan,
    LessThanEquals,
    GreaterThanEquals,
}

impl Comparison {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Equals => ordering == Ordering::Equal,
            Comparison::LessThan => ordering == Ordering::Less,
            Comparison::GreaterThan => ordering == Ordering::Greater,
            Comparison::LessThanEquals => ordering != Ordering::Greater,
            Comparison::GreaterThanEquals => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeTest {
    IsPresent,
    IsNull,
    IsString,
    IsNumeric,
    IsBoolean,
    IsTimestamp,
}

/// A recognised operator key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operator {
    Compare {
        domain: Domain,
        comparison: Comparison,
        operand_is_path: bool,
    },
    StringMatches,
    Test(TypeTest),
}

/// Parse an operator key such as `NumericLessThanEqualsPath`.
pub(crate) fn parse_operator(key: &str) -> Option<Operator> {
    let test = match key {
        "StringMatches" => return Some(Operator::StringMatches),
        "IsPresent" => Some(TypeTest::IsPresent),
        "IsNull" => Some(TypeTest::IsNull),
        "IsString" => Some(TypeTest::IsString),
        "IsNumeric" => Some(TypeTest::IsNumeric),
        "IsBoolean" => Some(TypeTest::IsBoolean),
        "IsTimestamp" => Some(TypeTest::IsTimestamp),
        _ => None,
    };
    if let Some(test) = test {
        return Some(Operator::Test(test));
    }

    let (body, operand_is_path) = match key.strip_suffix("Path") {
        Some(body) => (body, true),
        None => (key, false),
    };
    let (domain, rest) = [
        ("String", Domain::String),
        ("Numeric", Domain::Numeric),
        ("Boolean", Domain::Boolean),
        ("Timestamp", Domain::Timestamp),
    ]
    .into_iter()
    .find_map(|(prefix, domain)| body.strip_prefix(prefix).map(|rest| (domain, rest)))?;

    let comparison = match rest {
        "Equals" => Comparison::Equals,
        "LessThan" => Comparison::LessThan,
        "GreaterThan" => Comparison::GreaterThan,
        "LessThanEquals" => Comparison::LessThanEquals,
        "GreaterThanEquals" => Comparison::GreaterThanEquals,
        _ => return None,
    };
    if domain == Domain::Boolean && comparison != Comparison::Equals {
        return None;
    }
    Some(Operator::Compare {
        domain,
        comparison,
        operand_is_path,
    })
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Return the first rule, in list order, that evaluates true.
pub fn find_choice<'r>(
    rules: &'r [ChoiceRule],
    data: &Value,
    context: &Value,
) -> Option<&'r ChoiceRule> {
    rules.iter().find(|rule| evaluate(rule, data, context))
}

/// Evaluate one rule (leaf or combinator) against `data`.
pub fn evaluate(rule: &ChoiceRule, data: &Value, context: &Value) -> bool {
    if let Some(all) = &rule.and {
        return all.iter().all(|r| evaluate(r, data, context));
    }
    if let Some(any) = &rule.or {
        return any.iter().any(|r| evaluate(r, data, context));
    }
    if let Some(inner) = &rule.not {
        return !evaluate(inner, data, context);
    }

    let mut operators = rule
        .operators
        .iter()
        .filter_map(|(key, operand)| parse_operator(key).map(|op| (op, operand)));
    let (Some((operator, operand)), None) = (operators.next(), operators.next()) else {
        return false;
    };
    let Some(variable) = &rule.variable else {
        return false;
    };
    let value = lookup(variable, data, context);

    match operator {
        Operator::Test(test) => type_test(test, value.as_ref(), operand),
        Operator::StringMatches => match (value.as_ref().and_then(Value::as_str), operand.as_str()) {
            (Some(s), Some(pattern)) => regex_matches(pattern, s),
            _ => false,
        },
        Operator::Compare {
            domain,
            comparison,
            operand_is_path,
        } => {
            let Some(value) = value else {
                return false;
            };
            let right = if operand_is_path {
                match operand.as_str().and_then(|p| lookup(p, data, context)) {
                    Some(v) => v,
                    None => return false,
                }
            } else {
                operand.clone()
            };
            compare(domain, &value, &right).is_some_and(|ord| comparison.holds(ord))
        }
    }
}

fn lookup(path: &str, data: &Value, context: &Value) -> Option<Value> {
    let path = JsonPath::parse(path).ok()?;
    let root = match path.root() {
        PathRoot::Data => data,
        PathRoot::Context => context,
    };
    path.query(root).ok()
}

fn compare(domain: Domain, left: &Value, right: &Value) -> Option<Ordering> {
    match domain {
        Domain::String => Some(left.as_str()?.cmp(right.as_str()?)),
        Domain::Numeric => left.as_f64()?.partial_cmp(&right.as_f64()?),
        Domain::Boolean => Some(left.as_bool()?.cmp(&right.as_bool()?)),
        Domain::Timestamp => Some(timestamp(left)?.cmp(&timestamp(right)?)),
    }
}

fn timestamp(value: &Value) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(value.as_str()?).ok()
}

fn type_test(test: TypeTest, value: Option<&Value>, operand: &Value) -> bool {
    let Some(expected) = operand.as_bool() else {
        return false;
    };
    if test == TypeTest::IsPresent {
        return value.is_some() == expected;
    }
    let Some(value) = value else {
        return false;
    };
    let actual = match test {
        TypeTest::IsNull => value.is_null(),
        TypeTest::IsString => value.is_string(),
        TypeTest::IsNumeric => value.is_number(),
        TypeTest::IsBoolean => value.is_boolean(),
        TypeTest::IsTimestamp => timestamp(value).is_some(),
        TypeTest::IsPresent => true,
    };
    actual == expected
}

/// Unanchored regex search of `pattern` in `text`. A pattern that does not
/// compile never matches; definitions with one are rejected by validation.
pub(crate) fn regex_matches(pattern: &str, text: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(text),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "StringMatches pattern does not compile");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
