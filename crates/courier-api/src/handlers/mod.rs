//! Request handlers for the monitoring surface.

pub mod dead_letter;
pub mod health;
pub mod stats;

pub use dead_letter::{list_dead_letters, reprocess_dead_letters};
pub use health::health_check;
pub use stats::{get_activity, get_stats};

use axum::{http::StatusCode, response::IntoResponse, Json};

/// Maps an internal error to a 500 response with a structured body.
pub(crate) fn internal_error(error: impl std::fmt::Display) -> axum::response::Response {
    tracing::error!(error = %error, "monitoring request failed");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}
