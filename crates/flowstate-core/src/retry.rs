//! Retry and catch policy.
//!
//! Matching is by error name, with `States.ALL` as a wildcard and
//! `States.TaskFailed` matching everything except `States.Timeout`.
//! Cancellation errors never match. Each retry rule keeps its own attempt
//! counter for the lifetime of one state execution.

use std::time::Duration;

use flowstate_types::{ALL_ERRORS, CatchRule, ErrorKind, RetryRule, StatesError};

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// Whether any of `matchers` matches `error`.
///
/// With `match_messages`, a matcher equal to the error message also matches.
pub fn error_matches(matchers: &[String], error: &StatesError, match_messages: bool) -> bool {
    if error.is_aborted() {
        return false;
    }
    matchers.iter().any(|m| {
        m == ALL_ERRORS
            || m == error.name()
            || (m == ErrorKind::TaskFailed.as_str() && error.kind() != ErrorKind::Timeout)
            || (match_messages && m == error.message())
    })
}

/// First catch rule, in list order, whose matchers match `error`.
pub fn find_catcher<'c>(
    catchers: &'c [CatchRule],
    error: &StatesError,
    match_messages: bool,
) -> Option<&'c CatchRule> {
    catchers
        .iter()
        .find(|c| error_matches(&c.error_equals, error, match_messages))
}

// ---------------------------------------------------------------------------
// RetryTracker
// ---------------------------------------------------------------------------

/// What to do after an action failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep `delay`, then re-run the action. `attempt` is the rule's
    /// counter after this failure, starting at 1.
    Retry {
        rule_index: usize,
        attempt: u32,
        delay: Duration,
    },
    /// No rule matched, or the matching rule has no attempts left.
    Exhausted,
}

/// Per-rule attempt counters for one state execution.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    attempts: Vec<u32>,
}

impl RetryTracker {
    pub fn new(rules: &[RetryRule]) -> Self {
        Self {
            attempts: vec![0; rules.len()],
        }
    }

    /// Decide whether `error` should be retried. Every failure counts against
    /// the first matching rule; once its counter reaches `MaxAttempts` the
    /// error goes to Catch, so a rule allows `MaxAttempts - 1` retries.
    pub fn next_decision(
        &mut self,
        rules: &[RetryRule],
        error: &StatesError,
        match_messages: bool,
    ) -> RetryDecision {
        let Some((index, rule)) = rules
            .iter()
            .enumerate()
            .find(|(_, r)| error_matches(&r.error_equals, error, match_messages))
        else {
            return RetryDecision::Exhausted;
        };

        let Some(count) = self.attempts.get_mut(index) else {
            return RetryDecision::Exhausted;
        };
        *count = count.saturating_add(1);
        if *count >= rule.max_attempts {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry {
            rule_index: index,
            attempt: *count,
            delay: backoff_delay(rule, *count),
        }
    }

    /// Attempts consumed so far by the rule at `index`.
    pub fn attempts(&self, index: usize) -> u32 {
        self.attempts.get(index).copied().unwrap_or(0)
    }
}

/// `IntervalSeconds * BackoffRate^(attempt - 1)`, capped by `MaxDelaySeconds`.
pub fn backoff_delay(rule: &RetryRule, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let mut secs = rule.interval_seconds * rule.backoff_rate.powi(exponent);
    if let Some(max) = rule.max_delay_seconds {
        secs = secs.min(max);
    }
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
