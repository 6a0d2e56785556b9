//! Exponential backoff retry policy.
//!
//! Delays double per attempt from a fixed base up to a hard cap:
//! 5s, 10s, 20s, ... capped at 5 minutes. The ladder is deterministic; due
//! times are persisted on the record rather than held in process timers.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{DEFAULT_MAX_RETRIES, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS};

/// Retry policy for failed deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,

    /// Base delay for the exponential ladder.
    pub base_delay: Duration,

    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RETRY_MAX_DELAY_MS),
        }
    }
}

/// Result of a retry decision for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the backoff delay.
    Retry {
        /// Delay before the next attempt.
        delay: Duration,
        /// Absolute due time of the next attempt.
        next_attempt_at: DateTime<Utc>,
    },
    /// Budget exhausted; quarantine the event.
    GiveUp {
        /// Why no further retries happen.
        reason: String,
    },
}

impl RetryPolicy {
    /// Backoff delay for retry `k` (1-based): `min(base * 2^(k-1), cap)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        let multiplier = 2_u32.saturating_pow(exponent);
        std::cmp::min(self.base_delay * multiplier, self.max_delay)
    }

    /// Decides whether retry number `retry_count` fits the budget, given a
    /// per-event `max_retries` override.
    pub fn decide(&self, retry_count: u32, max_retries: u32, now: DateTime<Utc>) -> RetryDecision {
        if retry_count > max_retries {
            return RetryDecision::GiveUp {
                reason: format!("retry budget ({max_retries}) exhausted"),
            };
        }

        let delay = self.backoff_delay(retry_count);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { delay, next_attempt_at: now + chrono_delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();

        let delays: Vec<_> = (1..=4).map(|k| policy.backoff_delay(k)).collect();

        assert_eq!(delays[0], Duration::from_secs(5));
        assert_eq!(delays[1], Duration::from_secs(10));
        assert_eq!(delays[2], Duration::from_secs(20));
        assert_eq!(delays[3], Duration::from_secs(40));
    }

    #[test]
    fn backoff_caps_at_five_minutes() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff_delay(7), Duration::from_secs(300));
        assert_eq!(policy.backoff_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn decision_respects_budget() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        match policy.decide(3, 3, now) {
            RetryDecision::Retry { delay, next_attempt_at } => {
                assert_eq!(delay, Duration::from_secs(20));
                assert_eq!(next_attempt_at, now + chrono::Duration::seconds(20));
            },
            RetryDecision::GiveUp { .. } => unreachable!("third retry fits a budget of 3"),
        }

        match policy.decide(4, 3, now) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => unreachable!("fourth retry exceeds a budget of 3"),
        }
    }

    #[test]
    fn per_event_budget_overrides_policy_default() {
        let policy = RetryPolicy::default();
        let now = Utc::now();

        assert!(matches!(policy.decide(2, 1, now), RetryDecision::GiveUp { .. }));
        assert!(matches!(policy.decide(1, 1, now), RetryDecision::Retry { .. }));
    }
}
