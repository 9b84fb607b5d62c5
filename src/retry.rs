//! Retry policy engine.
//!
//! Given the attempt that just failed and its error, decide whether to try
//! again and after how long. The decision is a pure function of its inputs so
//! the same history always yields the same schedule on replay.
use std::time::Duration;

use crate::{AppErrorKind, ErrorDetails};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt.
    pub initial_interval: Duration,
    /// Multiplier applied per further attempt; must be >= 1.0.
    pub backoff_coefficient: f64,
    /// Upper bound for any single delay.
    pub maximum_interval: Duration,
    /// Total attempts including the first. 0 means unlimited.
    pub maximum_attempts: u32,
    /// Error messages (or message prefixes) that must never be retried.
    pub non_retryable_error_types: Vec<String>,
    /// Whether an activity timeout counts as retryable.
    pub timeout_is_retryable: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(10),
            maximum_attempts: 3,
            non_retryable_error_types: Vec::new(),
            timeout_is_retryable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicyError {
    ZeroInitialInterval,
    CoefficientBelowOne(String),
    MaximumBelowInitial,
}

impl std::fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicyError::ZeroInitialInterval => write!(f, "initial_interval must be greater than zero"),
            RetryPolicyError::CoefficientBelowOne(c) => write!(f, "backoff_coefficient must be >= 1.0 (got {c})"),
            RetryPolicyError::MaximumBelowInitial => write!(f, "maximum_interval must be >= initial_interval"),
        }
    }
}

impl std::error::Error for RetryPolicyError {}

impl RetryPolicy {
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, d: Duration) -> Self {
        self.initial_interval = d;
        self
    }

    pub fn with_backoff_coefficient(mut self, c: f64) -> Self {
        self.backoff_coefficient = c;
        self
    }

    pub fn with_maximum_interval(mut self, d: Duration) -> Self {
        self.maximum_interval = d;
        self
    }

    pub fn with_non_retryable(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_error_types.push(error_type.into());
        self
    }

    pub fn with_timeout_retryable(mut self, retryable: bool) -> Self {
        self.timeout_is_retryable = retryable;
        self
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.initial_interval.is_zero() {
            return Err(RetryPolicyError::ZeroInitialInterval);
        }
        if self.backoff_coefficient.is_nan() || self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::CoefficientBelowOne(self.backoff_coefficient.to_string()));
        }
        if self.maximum_interval < self.initial_interval {
            return Err(RetryPolicyError::MaximumBelowInitial);
        }
        Ok(())
    }

    /// `min(initial × coefficient^(attempt−1), maximum)` for `attempt >= 1`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_coefficient.powi(exponent);
        let initial = self.initial_interval.as_secs_f64();
        let max = self.maximum_interval.as_secs_f64();
        let secs = initial * factor;
        if !secs.is_finite() || secs >= max {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn is_listed_non_retryable(&self, details: &ErrorDetails) -> bool {
        if self.non_retryable_error_types.is_empty() {
            return false;
        }
        let message = details.message();
        self.non_retryable_error_types
            .iter()
            .any(|t| message == *t || message.starts_with(&format!("{t}:")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp(ErrorDetails),
}

/// Decide what to do after `attempt` (1-based) failed with `error`.
pub fn next_action(policy: &RetryPolicy, attempt: u32, error: &ErrorDetails) -> RetryDecision {
    let retryable = if error.is_timeout() {
        policy.timeout_is_retryable
    } else {
        error.is_retryable()
    };
    if !retryable || policy.is_listed_non_retryable(error) {
        return RetryDecision::GiveUp(error.clone());
    }
    if policy.maximum_attempts != 0 && attempt >= policy.maximum_attempts {
        return RetryDecision::GiveUp(error.clone());
    }
    RetryDecision::Retry {
        after: policy.backoff_for_attempt(attempt),
    }
}

/// Timeout and retry policy applied to one activity call.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityOptions {
    /// Per-attempt limit (start-to-close). `None` disables the deadline.
    pub timeout: Option<Duration>,
    pub retry_policy: RetryPolicy,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(10)),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl ActivityOptions {
    pub fn new(timeout: Option<Duration>, retry_policy: RetryPolicy) -> Self {
        Self { timeout, retry_policy }
    }
}

pub(crate) fn activity_failure(message: impl Into<String>, retryable: bool) -> ErrorDetails {
    ErrorDetails::Application {
        kind: AppErrorKind::ActivityFailed,
        message: message.into(),
        retryable,
    }
}
