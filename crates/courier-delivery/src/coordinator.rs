//! Processing coordinator: classifies handler outcomes and drives the
//! retry/backoff/dead-letter state machine.
//!
//! Each delivery attempt moves `Dispatched -> { Completed | RetryScheduled |
//! DeadLettered }`. Handler failures never escape this boundary; bookkeeping
//! failures while persisting retry metadata are logged and swallowed, a
//! best-effort choice that trades a small risk of retry-count drift for not
//! needing a two-phase commit around the decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use courier_core::{Clock, EventId, QueueMessage};
use tracing::{debug, error, info, warn};

use crate::{
    circuit::CircuitBreakerRegistry,
    classify::{FailureClass, FailureClassifier},
    error::HandlerError,
    handler::HandlerRegistry,
    retry::{RetryDecision, RetryPolicy},
    store::EventStore,
};

/// Terminal state of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded; the durable record was deleted.
    Completed,

    /// Handler failed; a durable retry is scheduled.
    RetryScheduled {
        /// Retry number this failure consumed (1-based).
        retry_count: u32,
        /// When the retry becomes due.
        next_attempt_at: DateTime<Utc>,
    },

    /// The event was quarantined.
    DeadLettered {
        /// Why the event was quarantined.
        reason: String,
    },

    /// The message was skipped (no handler registered, or the record is
    /// already gone).
    Skipped,
}

/// Coordinates handler invocation and failure handling for one process.
pub struct Coordinator {
    store: Arc<dyn EventStore>,
    circuit: Arc<CircuitBreakerRegistry>,
    classifier: FailureClassifier,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Coordinator {
    /// Creates a coordinator over the given collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        circuit: Arc<CircuitBreakerRegistry>,
        classifier: FailureClassifier,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, circuit, classifier, policy, clock }
    }

    /// Processes one dequeued message end to end.
    ///
    /// Never returns an error: every failure mode resolves to an outcome and
    /// is reflected in the durable record's state.
    pub async fn process(&self, msg: &QueueMessage, registry: &HandlerRegistry) -> ProcessOutcome {
        let Some(handler) = registry.get(msg.event_type) else {
            warn!(
                event_id = %msg.event_id,
                event_type = %msg.event_type,
                "no handler registered, skipping event"
            );
            self.delete_record(msg.event_id).await;
            return ProcessOutcome::Skipped;
        };

        debug!(
            event_id = %msg.event_id,
            event_type = %msg.event_type,
            attempt = msg.attempt,
            "dispatching event to handler"
        );

        match handler.handle(msg.event_type, &msg.payload).await {
            Ok(()) => {
                self.delete_record(msg.event_id).await;
                info!(
                    event_id = %msg.event_id,
                    event_type = %msg.event_type,
                    attempt = msg.attempt,
                    "event handled successfully"
                );
                ProcessOutcome::Completed
            },
            Err(handler_error) => self.handle_failure(msg, &handler_error).await,
        }
    }

    /// Applies the failure classification and retry state machine.
    async fn handle_failure(
        &self,
        msg: &QueueMessage,
        handler_error: &HandlerError,
    ) -> ProcessOutcome {
        let error_text = handler_error.to_string();

        match self.classifier.classify(msg.event_type, handler_error) {
            FailureClass::NonRetryable => {
                let reason = if self.classifier.is_denylisted(msg.event_type) {
                    format!("non-retryable event type: {error_text}")
                } else {
                    format!("non-retryable failure: {error_text}")
                };
                self.dead_letter(msg, &reason).await
            },
            FailureClass::Retryable => self.schedule_or_dead_letter(msg, &error_text).await,
        }
    }

    /// Standard retry path: budget check, circuit check, durable backoff.
    async fn schedule_or_dead_letter(&self, msg: &QueueMessage, error_text: &str) -> ProcessOutcome {
        // Re-read the record so the retry count reflects every prior attempt,
        // not just what this message carried
        let record = match self.store.find(msg.event_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(
                    event_id = %msg.event_id,
                    "record missing during retry scheduling, skipping"
                );
                return ProcessOutcome::Skipped;
            },
            Err(e) => {
                // Without the record there is no retry count to advance; the
                // record stays enqueued and recovery will release it
                error!(event_id = %msg.event_id, error = %e, "failed to re-read event record");
                return ProcessOutcome::Skipped;
            },
        };

        let retry_count = u32::try_from(record.retry_count).unwrap_or(0) + 1;
        let max_retries = u32::try_from(record.max_retries).unwrap_or(0);
        let now = self.clock.now();

        let (delay, next_attempt_at) = match self.policy.decide(retry_count, max_retries, now) {
            RetryDecision::GiveUp { reason } => {
                return self.dead_letter(msg, &format!("{reason}: {error_text}")).await;
            },
            RetryDecision::Retry { delay, next_attempt_at } => (delay, next_attempt_at),
        };

        let key = self.circuit.key(msg.event_type, error_text);
        if self.circuit.is_open(&key).await {
            // An open circuit bypasses whatever retry budget remains
            return self
                .dead_letter(msg, &format!("circuit open for {key}: {error_text}"))
                .await;
        }
        self.circuit.record_failure(&key).await;

        // Best-effort bookkeeping: a failed write means this attempt is not
        // counted and the record keeps its previous due time
        if let Err(e) = self
            .store
            .schedule_retry(
                msg.event_id,
                i32::try_from(retry_count).unwrap_or(i32::MAX),
                error_text,
                now,
                next_attempt_at,
            )
            .await
        {
            warn!(
                event_id = %msg.event_id,
                error = %e,
                "failed to persist retry metadata"
            );
        }

        warn!(
            event_id = %msg.event_id,
            event_type = %msg.event_type,
            retry_count,
            delay_ms = delay.as_millis(),
            next_attempt_at = %next_attempt_at,
            error = %error_text,
            "handler failed, retry scheduled"
        );

        ProcessOutcome::RetryScheduled { retry_count, next_attempt_at }
    }

    /// Quarantines the event, preserving its record.
    async fn dead_letter(&self, msg: &QueueMessage, reason: &str) -> ProcessOutcome {
        let now = self.clock.now();

        if let Err(e) = self.store.mark_dead_letter(msg.event_id, reason, now).await {
            // The record stays live and will surface again via the sweeper
            error!(
                event_id = %msg.event_id,
                error = %e,
                "failed to persist dead-letter transition"
            );
        }

        error!(
            event_id = %msg.event_id,
            event_type = %msg.event_type,
            attempt = msg.attempt,
            reason,
            "event dead-lettered"
        );

        ProcessOutcome::DeadLettered { reason: reason.to_string() }
    }

    async fn delete_record(&self, event_id: EventId) {
        match self.store.delete(event_id).await {
            Ok(true) => {},
            Ok(false) => {
                debug!(event_id = %event_id, "record already deleted");
            },
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "failed to delete completed record");
            },
        }
    }
}
