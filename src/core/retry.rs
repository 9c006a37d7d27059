//! Retry policy for tasks.
//!
//! Backoff is a fixed delay between attempts; there is no exponential growth.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::task::TaskError;

/// How a task is retried after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt (0 = run once).
    /// `max_attempts = 2` means at most 3 invocations in total.
    pub max_attempts: u32,

    /// Fixed delay before each retry.
    #[serde(with = "crate::core::serde_secs")]
    pub backoff: Duration,

    /// Which failures are worth retrying.
    #[serde(default)]
    pub retry_on: RetryCondition,
}

/// Conditions under which a failed attempt is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Retry on any error.
    #[default]
    Always,

    /// Retry only errors that [`TaskError::is_transient`] accepts.
    TransientOnly,

    /// Never retry, regardless of `max_attempts`.
    Never,
}

impl RetryPolicy {
    /// A policy with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff: Duration::ZERO,
            retry_on: RetryCondition::Never,
        }
    }

    /// A policy with `max_attempts` retries, `backoff` apart.
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            retry_on: RetryCondition::Always,
        }
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Total invocations this policy allows, including the first.
    pub fn total_attempts(&self) -> u32 {
        match self.retry_on {
            RetryCondition::Never => 1,
            _ => self.max_attempts.saturating_add(1),
        }
    }

    /// Decide whether to retry after `attempts` failed invocations.
    pub fn should_retry(&self, attempts: u32, error: &TaskError) -> bool {
        if attempts >= self.total_attempts() {
            return false;
        }
        match self.retry_on {
            RetryCondition::Always => true,
            RetryCondition::TransientOnly => error.is_transient(),
            RetryCondition::Never => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
