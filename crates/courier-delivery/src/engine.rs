//! Delivery engine: owns and supervises the consumer worker, retry
//! sweeper, and recovery service for one process.
//!
//! `start` reconciles orphaned records, then spawns the supervised tasks.
//! `shutdown_graceful` cancels them and waits for in-flight work within a
//! bounded timeout. Dropping a running engine cancels its tasks.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    broker::Broker,
    circuit::{CircuitBreakerRegistry, CircuitConfig},
    classify::FailureClassifier,
    coordinator::Coordinator,
    error::{DeliveryError, Result},
    handler::HandlerRegistry,
    recovery::{RecoveryConfig, RecoveryService},
    retry::RetryPolicy,
    store::EventStore,
    sweeper::{RetrySweeper, SweeperConfig},
    worker::{ConsumerWorker, WorkerConfig, WorkerStats},
    SHUTDOWN_GRACE_SECS,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Queue events are consumed from and retries re-enqueued to.
    pub queue: String,

    /// Retry policy applied to handler failures.
    pub retry_policy: RetryPolicy,

    /// Circuit breaker configuration.
    pub circuit: CircuitConfig,

    /// Maximum records the sweeper claims per pass.
    pub sweeper_batch_size: usize,

    /// How often the sweeper polls for due records.
    pub sweeper_poll_interval: Duration,

    /// Grace window granted to in-flight handlers on shutdown.
    pub shutdown_grace: Duration,

    /// Recovery and retention configuration.
    pub recovery: RecoveryConfig,

    /// Maximum time to wait for supervised tasks during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: crate::DEFAULT_QUEUE.to_string(),
            retry_policy: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            sweeper_batch_size: 100,
            sweeper_poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(SHUTDOWN_GRACE_SECS),
            recovery: RecoveryConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Supervises the delivery tasks of one worker process.
pub struct DeliveryEngine {
    store: Arc<dyn EventStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    classifier: FailureClassifier,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    cancellation_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    worker_stats: Option<Arc<RwLock<WorkerStats>>>,
}

impl DeliveryEngine {
    /// Creates an engine over the given collaborators.
    pub fn new(
        store: Arc<dyn EventStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        classifier: FailureClassifier,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            classifier,
            clock,
            config,
            cancellation_token: CancellationToken::new(),
            tasks: Vec::new(),
            worker_stats: None,
        }
    }

    /// Reconciles orphans and spawns the supervised delivery tasks.
    ///
    /// Returns immediately after spawning. Use `shutdown_graceful` to stop.
    ///
    /// # Errors
    ///
    /// Returns error if called on an already-started engine.
    pub async fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(DeliveryError::configuration("engine already started"));
        }

        info!(queue = %self.config.queue, "starting delivery engine");

        let recovery = RecoveryService::new(
            self.store.clone(),
            self.clock.clone(),
            self.cancellation_token.clone(),
            self.config.recovery.clone(),
        );

        // Orphan release only delays delivery when it fails, so startup
        // proceeds either way
        if let Err(e) = recovery.reconcile_orphans().await {
            warn!(error = %e, "startup orphan reconciliation failed");
        }

        let circuit = Arc::new(CircuitBreakerRegistry::new(
            self.config.circuit.clone(),
            self.clock.clone(),
        ));
        let coordinator = Arc::new(Coordinator::new(
            self.store.clone(),
            circuit,
            self.classifier.clone(),
            self.config.retry_policy.clone(),
            self.clock.clone(),
        ));

        let worker = ConsumerWorker::new(
            self.broker.clone(),
            coordinator,
            self.registry.clone(),
            self.cancellation_token.clone(),
            WorkerConfig {
                queue: self.config.queue.clone(),
                shutdown_grace: self.config.shutdown_grace,
            },
        );
        self.worker_stats = Some(worker.stats_handle());

        let sweeper = RetrySweeper::new(
            self.store.clone(),
            self.broker.clone(),
            self.clock.clone(),
            self.cancellation_token.clone(),
            SweeperConfig {
                queue: self.config.queue.clone(),
                batch_size: self.config.sweeper_batch_size,
                poll_interval: self.config.sweeper_poll_interval,
            },
        );

        self.tasks.push((
            "worker",
            tokio::spawn(async move {
                if let Err(e) = worker.run().await {
                    error!(error = %e, "consumer worker terminated with error");
                }
            }),
        ));
        self.tasks.push(("sweeper", tokio::spawn(async move { sweeper.run().await })));
        self.tasks.push(("recovery", tokio::spawn(async move { recovery.run().await })));

        info!(tasks = self.tasks.len(), "delivery engine started");
        Ok(())
    }

    /// Cancels the supervised tasks and waits for them to finish.
    ///
    /// # Errors
    ///
    /// Returns error if tasks do not finish within the shutdown timeout.
    pub async fn shutdown_graceful(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        self.cancellation_token.cancel();
        let timeout = self.config.shutdown_timeout;

        let tasks = std::mem::take(&mut self.tasks);
        let join_all = async {
            for (name, handle) in tasks {
                if let Err(join_error) = handle.await {
                    error!(task = name, error = %join_error, "task panicked during shutdown");
                }
            }
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(()) => {
                info!("delivery engine shutdown complete");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "engine shutdown timed out with tasks still running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Snapshot of the worker counters; zeroed before `start`.
    pub async fn worker_stats(&self) -> WorkerStats {
        match &self.worker_stats {
            Some(stats) => *stats.read().await,
            None => WorkerStats::default(),
        }
    }

    /// Whether any supervised task is still running.
    pub fn has_active_tasks(&self) -> bool {
        self.tasks.iter().any(|(_, handle)| !handle.is_finished())
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if self.has_active_tasks() && !self.cancellation_token.is_cancelled() {
            warn!(
                "delivery engine dropped with active tasks, cancelling; call \
                 shutdown_graceful() for a clean stop"
            );
            self.cancellation_token.cancel();
        }
    }
}
