//! Retry decisions and backoff schedule for step jobs.
//!
//! The queue owns re-execution; this module only answers two questions for
//! the step runner: should this failure be retried, and when.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sagaflow_types::retry::RetryPolicy;

/// Fractional spread applied when a policy randomizes its delay.
pub const JITTER_FACTOR: f64 = 0.2;

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for step failures.
///
/// All logic is in associated functions that take the policy as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed attempt should be handed back to the queue.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, retryable: bool) -> bool {
        retryable && attempt < policy.max_attempts()
    }

    /// Delay before the attempt after `attempt`, without jitter.
    ///
    /// Exponential policies grow as `initial * multiplier^(attempt-1)`;
    /// linear ones (multiplier 1.0) as `initial * attempt`. Both cap at
    /// `max_interval_secs`.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = policy.initial_interval_secs as f64;
        let raw = if policy.is_linear() {
            initial * f64::from(attempt)
        } else {
            initial * policy.multiplier.powi(attempt as i32 - 1)
        };
        let capped = raw.min(policy.max_interval_secs as f64).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Backoff with up to `JITTER_FACTOR` spread when the policy randomizes.
    pub fn backoff_with_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = Self::backoff(policy, attempt);
        if !policy.randomize || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - JITTER_FACTOR)..(1.0 + JITTER_FACTOR));
        base.mul_f64(factor)
    }

    /// Absolute time of the next attempt.
    pub fn next_retry_at(policy: &RetryPolicy, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = Self::backoff_with_jitter(policy, attempt);
        match chrono::Duration::from_std(delay) {
            Ok(delay) => now + delay,
            Err(_) => now,
        }
    }
}
