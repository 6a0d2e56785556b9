//! Error types for the delivery engine.
//!
//! Splits the taxonomy the pipeline cares about: `HandlerError` is what
//! domain handlers fail with and drives the retry/dead-letter decision;
//! `DeliveryError` covers engine-level failures around queueing,
//! persistence bookkeeping, circuit protection, and shutdown.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure returned by a domain event handler.
///
/// The variant, not the message text, determines how the coordinator
/// classifies the failure. `RateLimited` and `ContractViolation` need
/// operational remediation and are never retried mechanically.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// A downstream dependency rejected the work for rate-limiting reasons.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Description of the limit that was hit.
        message: String,
    },

    /// A downstream contract was violated (bad request, schema mismatch).
    #[error("downstream contract violation: {message}")]
    ContractViolation {
        /// Description of the violated contract.
        message: String,
    },

    /// Any other handler failure; retried within the event's budget.
    #[error("handler failed: {message}")]
    Failed {
        /// Description of the failure.
        message: String,
    },
}

impl HandlerError {
    /// Creates a rate-limit failure.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited { message: message.into() }
    }

    /// Creates a contract-violation failure.
    pub fn contract_violation(message: impl Into<String>) -> Self {
        Self::ContractViolation { message: message.into() }
    }

    /// Creates a generic handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed { message: message.into() }
    }
}

/// Engine-level error for delivery operations.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Broker publish or subscribe failed.
    #[error("queue error: {message}")]
    Queue {
        /// Description of the queue failure.
        message: String,
    },

    /// Persistence operation failed.
    #[error("database error: {message}")]
    Database {
        /// Description of the persistence failure.
        message: String,
    },

    /// Circuit breaker is open for a failure signature.
    #[error("circuit open for {key}")]
    CircuitOpen {
        /// The breaker key whose circuit is open.
        key: String,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Graceful shutdown did not finish within the allowed window.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// The window that elapsed.
        timeout: Duration,
    },

    /// A supervised task panicked.
    #[error("task '{task}' panicked: {message}")]
    TaskPanic {
        /// Name of the supervised task.
        task: &'static str,
        /// Panic description.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database { message: message.into() }
    }

    /// Creates a circuit-open error.
    pub fn circuit_open(key: impl Into<String>) -> Self {
        Self::CircuitOpen { key: key.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }
}

impl From<courier_core::CoreError> for DeliveryError {
    fn from(err: courier_core::CoreError) -> Self {
        Self::Database { message: err.to_string() }
    }
}
