//! Reliable event-delivery engine.
//!
//! Moves durable event records from publishers to registered handlers with
//! at-least-once semantics: exponential-backoff retries swept from durable
//! due times, per-failure-signature circuit breaking, dead-letter
//! quarantine, and startup reconciliation of orphaned records.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod circuit;
pub mod classify;
pub mod coordinator;
pub mod dead_letter;
pub mod engine;
pub mod error;
pub mod handler;
pub mod monitor;
pub mod publisher;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use broker::{Broker, InMemoryBroker};
pub use circuit::{BreakerKey, CircuitBreakerRegistry, CircuitConfig};
pub use classify::{FailureClass, FailureClassifier};
pub use coordinator::{Coordinator, ProcessOutcome};
pub use dead_letter::DeadLetterService;
pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{DeliveryError, HandlerError, Result};
pub use handler::{EventHandler, HandlerRegistry};
pub use monitor::{
    ActivityEntry, DeliveryStats, HealthAlert, HealthReport, HealthService, HealthThresholds,
    StatsService,
};
pub use publisher::{PublishOptions, Publisher};
pub use recovery::{RecoveryConfig, RecoveryService};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{EventStore, PostgresEventStore};
pub use sweeper::{RetrySweeper, SweeperConfig};
pub use worker::{ConsumerWorker, WorkerConfig, WorkerStats};

/// Default queue name events are published to and consumed from.
pub const DEFAULT_QUEUE: &str = "courier.events";

/// Default retry budget for a published event.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential backoff ladder, in milliseconds.
pub const RETRY_BASE_DELAY_MS: u64 = 5_000;

/// Upper bound on a single retry delay, in milliseconds.
pub const RETRY_MAX_DELAY_MS: u64 = 300_000;

/// Consecutive failures of one breaker key that open its circuit.
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Quiet period after which an open circuit resets, in seconds.
pub const CIRCUIT_RESET_AFTER_SECS: u64 = 30 * 60;

/// Grace window granted to in-flight handler tasks on shutdown, in seconds.
pub const SHUTDOWN_GRACE_SECS: u64 = 5;
