//! Error types and result handling for persistence operations.
//!
//! Defines the core error taxonomy used across the event-delivery pipeline.
//! Persistence failures map database-level error classes (not-found,
//! constraint violations) into structured variants so callers can decide
//! whether to propagate or log-and-continue.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Payload serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn serde_errors_map_to_serialization() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err = CoreError::from(json_err);
        assert!(matches!(err, CoreError::Serialization(_)));
    }
}
