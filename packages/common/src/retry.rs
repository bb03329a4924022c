use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single retry attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Error message from the failed attempt.
    pub error: String,
    /// When this attempt occurred.
    pub timestamp: DateTime<Utc>,
}

impl RetryAttempt {
    pub fn new(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failure.
    Fixed,
    /// `base * attempt` after the n-th failure.
    Linear,
}

/// Bounded retry budget for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Never less than 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Linear => linear_backoff(attempt, self.base_delay),
        }
    }
}

/// `base * attempt`, saturating. Attempt 0 means no wait.
pub fn linear_backoff(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt)
}

/// Result of recording a failure in the RetryTracker.
#[derive(Debug, Clone)]
pub enum RetryDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted { history: Vec<RetryAttempt> },
}

/// Tracks the failures of a single operation against its policy.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    policy: RetryPolicy,
    history: Vec<RetryAttempt>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            history: Vec::new(),
        }
    }

    /// Record a failed attempt and decide whether another one is allowed.
    pub fn record_failure(&mut self, error: impl Into<String>) -> RetryDecision {
        let attempt = self.history.len() as u32 + 1;
        self.history.push(RetryAttempt::new(attempt, error));

        if attempt < self.policy.max_attempts {
            RetryDecision::Retry {
                attempt,
                delay: self.policy.delay_after(attempt),
            }
        } else {
            RetryDecision::Exhausted {
                history: std::mem::take(&mut self.history),
            }
        }
    }

    /// Number of failures recorded so far.
    pub fn failures(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn history(&self) -> &[RetryAttempt] {
        &self.history
    }
}
