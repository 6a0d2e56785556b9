//! Durable retry sweeper.
//!
//! Retries and delayed publishes live as `pending` records with a due time,
//! not as in-process timers, so a restart never loses a scheduled attempt.
//! The sweeper periodically claims due records and re-enqueues them as new
//! broker messages carrying the same event id, an incremented attempt
//! marker, and lowered priority.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, EventRecord, QueueMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{broker::Broker, error::Result, store::EventStore};

/// Configuration for the retry sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Queue re-enqueued messages are published to.
    pub queue: String,

    /// Maximum records claimed per sweep.
    pub batch_size: usize,

    /// How often the sweeper polls for due records.
    pub poll_interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            queue: crate::DEFAULT_QUEUE.to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Periodically re-enqueues records whose due time has elapsed.
pub struct RetrySweeper {
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    config: SweeperConfig,
}

impl RetrySweeper {
    /// Creates a sweeper over the given collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
        config: SweeperConfig,
    ) -> Self {
        Self { store, broker, clock, cancellation_token, config }
    }

    /// Runs the sweep loop until cancelled.
    pub async fn run(&self) {
        info!(
            queue = %self.config.queue,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "retry sweeper starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            match self.sweep_once().await {
                Ok(0) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(enqueued) => {
                    debug!(enqueued, "sweep re-enqueued due records");
                },
                Err(e) => {
                    error!(error = %e, "sweep failed");
                    tokio::select! {
                        () = self.clock.sleep(Duration::from_secs(5)) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        info!("retry sweeper stopped");
    }

    /// Claims and re-enqueues one batch of due records, returning how many
    /// messages were enqueued. Exposed for tests and controlled sweeping.
    ///
    /// # Errors
    ///
    /// Returns error if the claim query fails; per-record enqueue failures
    /// are logged and the record is released for the next sweep.
    pub async fn sweep_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.claim_due(self.config.batch_size, now).await?;

        let mut enqueued = 0;
        for record in due {
            let message = build_retry_message(&record);

            match self.broker.publish(&self.config.queue, &message).await {
                Ok(()) => {
                    enqueued += 1;
                    debug!(
                        event_id = %record.id,
                        attempt = message.attempt,
                        priority = %message.priority,
                        "due record re-enqueued"
                    );
                },
                Err(e) => {
                    warn!(
                        event_id = %record.id,
                        error = %e,
                        "failed to re-enqueue due record, releasing claim"
                    );
                    if let Err(release_err) =
                        self.store.release_to_pending(record.id, now).await
                    {
                        error!(
                            event_id = %record.id,
                            error = %release_err,
                            "failed to release claimed record"
                        );
                    }
                },
            }
        }

        Ok(enqueued)
    }
}

/// Builds the broker message for a due record.
///
/// Retries carry lowered priority; a delayed first publish keeps the
/// priority it was published with.
fn build_retry_message(record: &EventRecord) -> QueueMessage {
    let priority =
        if record.retry_count > 0 { record.priority.lowered() } else { record.priority };

    QueueMessage {
        message_id: uuid::Uuid::new_v4(),
        event_id: record.id,
        event_type: record.event_type,
        payload: record.payload.clone(),
        attempt: record.next_attempt_number(),
        priority,
    }
}
