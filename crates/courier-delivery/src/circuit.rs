//! Circuit breaking keyed by failure signature.
//!
//! Tracks consecutive failures per `(event type, error signature)` pair so a
//! poison failure mode stops burning retry budget across many events while
//! unrelated failures of the same event kind keep their own window. State is
//! process-local by design; each worker process holds an independent view.
//!
//! A circuit opens after a fixed number of consecutive failures and resets
//! once the key has been quiet for the reset window. Entries are never
//! removed; the key space is bounded by event-type and error-prefix
//! cardinality.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{Clock, EventType};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_RESET_AFTER_SECS};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Consecutive failures of one key that open its circuit.
    pub failure_threshold: u32,

    /// Quiet period after which an open circuit resets.
    pub reset_after: Duration,

    /// Length the error message is truncated to when forming the signature.
    pub signature_len: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: CIRCUIT_FAILURE_THRESHOLD,
            reset_after: Duration::from_secs(CIRCUIT_RESET_AFTER_SECS),
            signature_len: 64,
        }
    }
}

/// Key identifying one failure mode of one event kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BreakerKey {
    /// The event kind that failed.
    pub event_type: EventType,
    /// Truncated failure message identifying the failure mode.
    pub signature: String,
}

impl std::fmt::Display for BreakerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.event_type, self.signature)
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    failures: u32,
    last_failure: DateTime<Utc>,
    is_open: bool,
}

/// Process-local registry of circuit breakers.
///
/// An explicit constructed object handed to the coordinator, so instances
/// stay isolated and the store behind it could be externalized without
/// touching call sites.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<BreakerKey, BreakerState>>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry with the given configuration.
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock, states: Mutex::new(HashMap::new()) }
    }

    /// Builds the breaker key for a failure of `event_type`.
    pub fn key(&self, event_type: EventType, error: &str) -> BreakerKey {
        let signature: String = error.chars().take(self.config.signature_len).collect();
        BreakerKey { event_type, signature }
    }

    /// Whether the circuit for this key is currently open.
    ///
    /// An open circuit whose quiet period has elapsed resets here: the
    /// counter returns to zero and a new failure window begins.
    pub async fn is_open(&self, key: &BreakerKey) -> bool {
        let now = self.clock.now();
        let mut states = self.states.lock().await;

        let Some(state) = states.get_mut(key) else {
            return false;
        };

        if self.window_expired(state, now) {
            state.failures = 0;
            state.is_open = false;
        }

        state.is_open
    }

    /// Records a failure for this key, returning whether the circuit is now
    /// open.
    pub async fn record_failure(&self, key: &BreakerKey) -> bool {
        let now = self.clock.now();
        let mut states = self.states.lock().await;

        let state = states.entry(key.clone()).or_insert(BreakerState {
            failures: 0,
            last_failure: now,
            is_open: false,
        });

        if self.window_expired(state, now) {
            state.failures = 0;
            state.is_open = false;
        }

        state.failures += 1;
        state.last_failure = now;

        if !state.is_open && state.failures >= self.config.failure_threshold {
            state.is_open = true;
            warn!(key = %key, failures = state.failures, "circuit breaker opened");
        }

        state.is_open
    }

    /// Number of keys currently tracked. Stale keys persist for the process
    /// lifetime.
    pub async fn tracked_keys(&self) -> usize {
        self.states.lock().await.len()
    }

    fn window_expired(&self, state: &BreakerState, now: DateTime<Utc>) -> bool {
        let quiet = now.signed_duration_since(state.last_failure);
        quiet.to_std().map_or(false, |quiet| quiet > self.config.reset_after)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::TestClock;

    use super::*;

    fn registry(clock: &TestClock) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitConfig::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn circuit_stays_closed_below_threshold() {
        let clock = TestClock::new();
        let registry = registry(&clock);
        let key = registry.key(EventType::CampaignPublished, "db timeout");

        for _ in 0..4 {
            assert!(!registry.record_failure(&key).await);
        }
        assert!(!registry.is_open(&key).await);
    }

    #[tokio::test]
    async fn fifth_consecutive_failure_opens_circuit() {
        let clock = TestClock::new();
        let registry = registry(&clock);
        let key = registry.key(EventType::CampaignPublished, "db timeout");

        for _ in 0..4 {
            registry.record_failure(&key).await;
        }
        assert!(registry.record_failure(&key).await);
        assert!(registry.is_open(&key).await);
    }

    #[tokio::test]
    async fn distinct_signatures_track_independently() {
        let clock = TestClock::new();
        let registry = registry(&clock);
        let timeout_key = registry.key(EventType::QuestCompleted, "db timeout");
        let refused_key = registry.key(EventType::QuestCompleted, "connection refused");

        for _ in 0..5 {
            registry.record_failure(&timeout_key).await;
        }

        assert!(registry.is_open(&timeout_key).await);
        assert!(!registry.is_open(&refused_key).await);
        assert_eq!(registry.tracked_keys().await, 2);
    }

    #[tokio::test]
    async fn open_circuit_resets_after_quiet_period() {
        let clock = TestClock::new();
        let registry = registry(&clock);
        let key = registry.key(EventType::BalanceUpdated, "ledger unavailable");

        for _ in 0..5 {
            registry.record_failure(&key).await;
        }
        assert!(registry.is_open(&key).await);

        clock.advance(Duration::from_secs(CIRCUIT_RESET_AFTER_SECS + 1));

        assert!(!registry.is_open(&key).await);

        // A new window starts counting from zero
        assert!(!registry.record_failure(&key).await);
    }

    #[tokio::test]
    async fn stale_counter_resets_before_new_window() {
        let clock = TestClock::new();
        let registry = registry(&clock);
        let key = registry.key(EventType::RewardGranted, "grant service 500");

        for _ in 0..4 {
            registry.record_failure(&key).await;
        }

        clock.advance(Duration::from_secs(CIRCUIT_RESET_AFTER_SECS + 1));

        // Old failures no longer count toward the threshold
        for _ in 0..4 {
            assert!(!registry.record_failure(&key).await);
        }
        assert!(registry.record_failure(&key).await);
    }

    #[tokio::test]
    async fn signature_is_truncated() {
        let clock = TestClock::new();
        let registry = registry(&clock);
        let long_error = "x".repeat(500);
        let key = registry.key(EventType::CampaignCompleted, &long_error);

        assert_eq!(key.signature.len(), CircuitConfig::default().signature_len);
    }
}
