//! Retry policies for failed indication deliveries.
//!
//! A failed attempt is retried no sooner than the minimum retry interval
//! after it failed. The delay may grow with the number of failures
//! (linear or exponential backoff) and may be randomized with jitter so
//! that many queues failing at once do not retry in lockstep.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy applied by a destination queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt. Zero disables reliable
    /// delivery entirely.
    pub max_retry_attempts: u16,

    /// Lower bound for the delay before any retry.
    pub min_retry_interval: Duration,

    /// Upper bound for a grown delay.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// How the delay grows with repeated failures.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            min_retry_interval: Duration::from_secs(20),
            max_delay: Duration::from_secs(600),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Fixed,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Every retry waits the minimum retry interval.
    #[default]
    Fixed,
    /// The delay doubles with each failure.
    Exponential,
    /// The delay grows by the minimum interval with each failure.
    Linear,
}

/// Outcome of evaluating a failed attempt against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again once `delay` has elapsed.
    Retry {
        /// Time to wait before the indication becomes eligible again
        delay: Duration,
    },
    /// Drop the indication.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Returns true if indications under this policy go through a queue.
    pub fn is_reliable(&self) -> bool {
        self.max_retry_attempts > 0
    }

    /// Decides what happens after a failed attempt.
    ///
    /// `failures` counts every failed attempt of the indication so far,
    /// including the one being evaluated. An indication is given up once
    /// `failures` exceeds `max_retry_attempts`, so it is attempted exactly
    /// `max_retry_attempts + 1` times. Errors that are not retryable are
    /// given up immediately.
    pub fn decide(&self, failures: u16, error: &DeliveryError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if failures > self.max_retry_attempts {
            return RetryDecision::GiveUp {
                reason: format!("delivery retry attempts ({}) exceeded", self.max_retry_attempts),
            };
        }

        RetryDecision::Retry { delay: self.delay_for(failures) }
    }

    /// Calculates the delay before the retry following failure number
    /// `failures`.
    ///
    /// The result is never below `min_retry_interval`.
    pub fn delay_for(&self, failures: u16) -> Duration {
        let floor = self.min_retry_interval;
        let ceiling = self.max_delay.max(floor);

        let grown = match self.backoff_strategy {
            BackoffStrategy::Fixed => floor,
            BackoffStrategy::Linear => floor.saturating_mul(u32::from(failures.max(1))),
            BackoffStrategy::Exponential => {
                let exponent = u32::from(failures.saturating_sub(1)).min(20);
                floor.saturating_mul(2_u32.saturating_pow(exponent))
            },
        };

        apply_jitter(grown.min(ceiling), self.jitter_factor).clamp(floor, ceiling)
    }
}

/// Randomizes a delay by ±`jitter_factor` of its length.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let jitter_range = duration.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    let offset = rand::rng().random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retry_attempts: 3,
            min_retry_interval: Duration::from_secs(20),
            max_delay: Duration::from_secs(100),
            jitter_factor: 0.0,
            backoff_strategy: strategy,
        }
    }

    #[test]
    fn fixed_backoff_always_waits_the_minimum_interval() {
        let policy = policy(BackoffStrategy::Fixed);
        for failures in 1..=3 {
            assert_eq!(policy.delay_for(failures), Duration::from_secs(20));
        }
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = policy(BackoffStrategy::Exponential);
        assert_eq!(policy.delay_for(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for(2), Duration::from_secs(40));
        assert_eq!(policy.delay_for(3), Duration::from_secs(80));
        assert_eq!(policy.delay_for(4), Duration::from_secs(100));
    }

    #[test]
    fn linear_backoff_grows_by_the_interval() {
        let policy = policy(BackoffStrategy::Linear);
        assert_eq!(policy.delay_for(1), Duration::from_secs(20));
        assert_eq!(policy.delay_for(2), Duration::from_secs(40));
        assert_eq!(policy.delay_for(3), Duration::from_secs(60));
    }

    #[test]
    fn delay_never_drops_below_minimum_interval() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            jitter_factor: 1.0,
            ..policy(BackoffStrategy::Exponential)
        };
        for failures in 1..=10 {
            assert!(policy.delay_for(failures) >= Duration::from_secs(20));
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy { jitter_factor: 0.25, ..policy(BackoffStrategy::Exponential) };
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_secs(30) && delay <= Duration::from_secs(50));
        }
    }

    #[test]
    fn gives_up_after_max_retries_plus_initial_attempt() {
        let policy = policy(BackoffStrategy::Fixed);
        let error = DeliveryError::network("refused");

        for failures in 1..=3 {
            assert!(matches!(policy.decide(failures, &error), RetryDecision::Retry { .. }));
        }
        assert!(matches!(policy.decide(4, &error), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn non_retryable_error_gives_up_immediately() {
        let policy = policy(BackoffStrategy::Fixed);
        let decision = policy.decide(1, &DeliveryError::listener(400, "bad request"));

        assert!(matches!(
            decision,
            RetryDecision::GiveUp { reason } if reason.contains("non-retryable")
        ));
    }

    #[test]
    fn zero_retries_disables_reliable_delivery() {
        let policy = RetryPolicy { max_retry_attempts: 0, ..RetryPolicy::default() };
        assert!(!policy.is_reliable());
        assert!(RetryPolicy::default().is_reliable());
    }
}
