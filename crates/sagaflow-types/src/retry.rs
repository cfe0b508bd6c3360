//! Retry policies attached to step definitions.
//!
//! A `RetryPolicy` tells the job queue how many times a failed step may be
//! re-attempted and how long to wait between attempts. Three canned policies
//! cover the common cases: `default_policy` for internal work, `aggressive`
//! for flaky external calls, and `none` for validation-class steps.

use serde::{Deserialize, Serialize};

/// Retry budget and backoff shape for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (total attempts = max_retries + 1).
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub initial_interval_secs: u64,
    /// Upper bound on any single delay, in seconds.
    pub max_interval_secs: u64,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Add jitter to the computed delay.
    #[serde(default)]
    pub randomize: bool,
}

impl RetryPolicy {
    /// 3 retries, 1 to 10 minutes, doubling, with jitter.
    pub fn default_policy() -> Self {
        Self {
            max_retries: 3,
            initial_interval_secs: 60,
            max_interval_secs: 600,
            multiplier: 2.0,
            randomize: true,
        }
    }

    /// 5 retries, 30 seconds to 5 minutes, x1.5, with jitter. For external calls.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            initial_interval_secs: 30,
            max_interval_secs: 300,
            multiplier: 1.5,
            randomize: true,
        }
    }

    /// No retries. For validation-class steps.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_interval_secs: 0,
            max_interval_secs: 0,
            multiplier: 1.0,
            randomize: false,
        }
    }

    /// Linear backoff of `attempt x 1 minute`, capped at 10 minutes.
    pub fn linear(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_interval_secs: 60,
            max_interval_secs: 600,
            multiplier: 1.0,
            randomize: false,
        }
    }

    /// Total attempts the queue may make (first run plus retries).
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether this policy grows the delay linearly with the attempt number.
    pub fn is_linear(&self) -> bool {
        (self.multiplier - 1.0).abs() < f64::EPSILON && self.initial_interval_secs > 0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}
