//! Retry schedule for failed consumer attempts.
//!
//! A failed attempt either reschedules the row according to a fixed delay
//! schedule indexed by the number of earlier failures, or gives up and marks
//! the row dead once the attempt budget is spent.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{DeliveryError, Result};

/// Retry policy configuration for consumer deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts (including the first).
    pub max_attempts: u32,

    /// Delay after the n-th failure, indexed by the failures before it.
    pub schedule: Vec<Duration>,

    /// Delay used once the failure count runs past the schedule.
    pub fallback_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            schedule: vec![
                Duration::from_secs(2),
                Duration::from_secs(10),
                Duration::from_secs(60),
                Duration::from_secs(30 * 60),
                Duration::from_secs(60 * 60),
            ],
            fallback_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt of a row that has failed `retry` times
    /// before the current failure.
    pub fn delay_for(&self, retry: u32) -> Duration {
        usize::try_from(retry)
            .ok()
            .and_then(|index| self.schedule.get(index))
            .copied()
            .unwrap_or(self.fallback_delay)
    }

    /// Checks the policy can ever deliver.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` when `max_attempts` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("retry policy max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Failed attempt awaiting a retry decision.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Failures recorded on the row before this attempt.
    pub retry: u32,
    /// Error text reported by the consumer.
    pub reason: String,
    /// Timestamp of the failed attempt.
    pub failed_at: DateTime<Utc>,
}

/// Result of retry decision calculation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the row eligible again at the given time.
    Retry {
        /// When the next delivery attempt may be made
        next_attempt_at: DateTime<Utc>,
    },
    /// Mark the row dead.
    GiveUp {
        /// Text recorded as the row's `failed_reason`
        reason: String,
    },
}

impl RetryContext {
    /// Creates a new retry context for a failed attempt.
    pub fn new(retry: u32, reason: impl Into<String>, failed_at: DateTime<Utc>) -> Self {
        Self { retry, reason: reason.into(), failed_at }
    }

    /// One-based number of the attempt that failed.
    pub fn attempt_number(&self) -> u32 {
        self.retry.saturating_add(1)
    }

    /// Decides between rescheduling and dead-lettering.
    ///
    /// The attempt that brings the total to `max_attempts` gives up; earlier
    /// attempts are rescheduled `delay_for(retry)` after `failed_at`.
    pub fn decide_retry(&self, policy: &RetryPolicy) -> RetryDecision {
        if self.attempt_number() >= policy.max_attempts {
            return RetryDecision::GiveUp { reason: self.reason.clone() };
        }

        let next_attempt_at = chrono::Duration::from_std(policy.delay_for(self.retry))
            .ok()
            .and_then(|delay| self.failed_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        RetryDecision::Retry { next_attempt_at }
    }
}

/// Random pause in `[0, max)` taken by a worker that found nothing to do or
/// hit a transient fault, so idle workers do not poll in lockstep.
pub fn idle_backoff(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max_ms))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn default_schedule_matches_documented_delays() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3600));
    }

    #[test]
    fn delay_past_schedule_uses_fallback() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn first_failure_retries_after_two_seconds() {
        let decision = RetryContext::new(0, "boom", at()).decide_retry(&RetryPolicy::default());

        assert_eq!(decision, RetryDecision::Retry {
            next_attempt_at: at() + chrono::Duration::seconds(2)
        });
    }

    #[test]
    fn final_attempt_gives_up_with_consumer_reason() {
        let policy = RetryPolicy::default();

        let decision = RetryContext::new(3, "still failing", at()).decide_retry(&policy);
        assert!(matches!(decision, RetryDecision::Retry { .. }));

        let decision = RetryContext::new(4, "still failing", at()).decide_retry(&policy);
        assert_eq!(decision, RetryDecision::GiveUp { reason: "still failing".to_string() });
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        let decision = RetryContext::new(0, "nope", at()).decide_retry(&policy);
        assert!(matches!(decision, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn zero_attempt_policy_is_invalid() {
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert!(policy.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[test]
    fn idle_backoff_stays_below_max() {
        let max = Duration::from_secs(3);
        for _ in 0..100 {
            assert!(idle_backoff(max) < max);
        }
        assert_eq!(idle_backoff(Duration::ZERO), Duration::ZERO);
    }
}
