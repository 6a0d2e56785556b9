//! Consumer worker loop: dequeues broker messages and dispatches them to
//! the processing coordinator.
//!
//! Each message is handled on a supervised task so the dequeue loop never
//! stalls behind a slow handler; the supervisor tracks every in-flight task
//! explicitly, so graceful shutdown awaits a known set with a bounded grace
//! window instead of abandoning detached work.

use std::{sync::Arc, time::Duration};

use courier_core::QueueMessage;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    broker::Broker,
    coordinator::{Coordinator, ProcessOutcome},
    error::Result,
    handler::HandlerRegistry,
    SHUTDOWN_GRACE_SECS,
};

/// Configuration for the consumer worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue the worker subscribes to.
    pub queue: String,

    /// Grace window granted to in-flight handler tasks on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: crate::DEFAULT_QUEUE.to_string(),
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Counters for worker monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages dispatched to handlers.
    pub dispatched: u64,
    /// Attempts that completed successfully.
    pub completed: u64,
    /// Attempts that scheduled a retry.
    pub retried: u64,
    /// Attempts that ended in quarantine.
    pub dead_lettered: u64,
    /// Messages skipped (no handler, missing record, or shutdown).
    pub skipped: u64,
    /// Messages rejected as malformed.
    pub malformed: u64,
}

/// Worker that consumes the event queue for this process.
pub struct ConsumerWorker {
    broker: Arc<dyn Broker>,
    coordinator: Arc<Coordinator>,
    registry: Arc<HandlerRegistry>,
    cancellation_token: CancellationToken,
    config: WorkerConfig,
    stats: Arc<tokio::sync::RwLock<WorkerStats>>,
}

impl ConsumerWorker {
    /// Creates a worker over the given collaborators.
    pub fn new(
        broker: Arc<dyn Broker>,
        coordinator: Arc<Coordinator>,
        registry: Arc<HandlerRegistry>,
        cancellation_token: CancellationToken,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            coordinator,
            registry,
            cancellation_token,
            config,
            stats: Arc::new(tokio::sync::RwLock::new(WorkerStats::default())),
        }
    }

    /// Snapshot of the worker counters.
    pub async fn stats(&self) -> WorkerStats {
        *self.stats.read().await
    }

    /// Shared handle to the worker counters, for engine-level reporting.
    pub fn stats_handle(&self) -> Arc<tokio::sync::RwLock<WorkerStats>> {
        self.stats.clone()
    }

    /// Runs the dequeue loop until cancelled.
    ///
    /// # Errors
    ///
    /// Returns error only if the initial subscription fails; processing
    /// failures are resolved per message.
    pub async fn run(&self) -> Result<()> {
        let mut rx = self.broker.subscribe(&self.config.queue).await?;
        let mut in_flight: JoinSet<ProcessOutcome> = JoinSet::new();

        info!(queue = %self.config.queue, "consumer worker starting");

        loop {
            tokio::select! {
                () = self.cancellation_token.cancelled() => {
                    // Anything the broker already handed us is skipped, not
                    // processed; the record survives for recovery
                    while let Ok(wire) = rx.try_recv() {
                        info!(
                            event_id = ?wire.get("eventId"),
                            "shutdown in progress, skipping dequeued message"
                        );
                        self.bump(|s| s.skipped += 1).await;
                    }
                    break;
                },
                received = rx.recv() => {
                    let Some(wire) = received else {
                        warn!(queue = %self.config.queue, "broker subscription closed");
                        break;
                    };
                    self.dispatch(wire, &mut in_flight).await;
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.reap(joined).await;
                },
            }
        }

        drop(rx);
        self.drain(in_flight).await;

        info!(queue = %self.config.queue, "consumer worker stopped");
        Ok(())
    }

    /// Decodes a wire message and spawns its processing task.
    async fn dispatch(&self, wire: serde_json::Value, in_flight: &mut JoinSet<ProcessOutcome>) {
        let Some(msg) = decode_message(wire) else {
            self.bump(|s| s.malformed += 1).await;
            return;
        };

        self.bump(|s| s.dispatched += 1).await;

        let coordinator = self.coordinator.clone();
        let registry = self.registry.clone();
        in_flight.spawn(async move { coordinator.process(&msg, &registry).await });
    }

    /// Folds a finished task's outcome into the counters.
    async fn reap(&self, joined: std::result::Result<ProcessOutcome, tokio::task::JoinError>) {
        match joined {
            Ok(outcome) => {
                self.bump(|s| match outcome {
                    ProcessOutcome::Completed => s.completed += 1,
                    ProcessOutcome::RetryScheduled { .. } => s.retried += 1,
                    ProcessOutcome::DeadLettered { .. } => s.dead_lettered += 1,
                    ProcessOutcome::Skipped => s.skipped += 1,
                })
                .await;
            },
            Err(join_error) => {
                error!(error = %join_error, "handler task panicked");
            },
        }
    }

    /// Awaits in-flight tasks within the shutdown grace window.
    async fn drain(&self, mut in_flight: JoinSet<ProcessOutcome>) {
        if in_flight.is_empty() {
            return;
        }

        info!(
            in_flight = in_flight.len(),
            grace_seconds = self.config.shutdown_grace.as_secs(),
            "waiting for in-flight handlers"
        );

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let joined = tokio::time::timeout_at(deadline, in_flight.join_next()).await;
            match joined {
                Ok(Some(result)) => self.reap(result).await,
                Ok(None) => break,
                Err(_elapsed) => {
                    warn!(
                        remaining = in_flight.len(),
                        "shutdown grace window elapsed with handlers still running"
                    );
                    // Let them run to completion unsupervised rather than
                    // aborting mid-handler
                    in_flight.detach_all();
                    break;
                },
            }
        }
    }

    async fn bump(&self, update: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.write().await;
        update(&mut stats);
    }
}

/// Defensively decodes a wire value into a queue message.
///
/// Tolerates both structured JSON and string-encoded JSON bodies. Messages
/// missing `eventId` or `eventType`, or carrying an unknown type tag, are
/// rejected with a log line and `None`.
pub fn decode_message(wire: serde_json::Value) -> Option<QueueMessage> {
    let value = match wire {
        serde_json::Value::String(encoded) => match serde_json::from_str(&encoded) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "rejecting string-encoded message that is not JSON");
                return None;
            },
        },
        value => value,
    };

    match serde_json::from_value::<QueueMessage>(value) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(error = %e, "rejecting malformed queue message");
            None
        },
    }
}
