//! Health check handler.
//!
//! Returns 200 while the delivery backlog is within thresholds and 503 with
//! the tripped alerts otherwise, so orchestration systems and pagers key
//! off the status code alone.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, instrument};

use super::internal_error;
use crate::AppState;

/// `GET /health`: threshold-based delivery health.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let report = match state.health.check().await {
        Ok(report) => report,
        Err(e) => return internal_error(e),
    };

    let status_code =
        if report.healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    debug!(
        healthy = report.healthy,
        alerts = report.alerts.len(),
        pending = report.stats.pending,
        dead_letter = report.stats.dead_letter,
        "health check completed"
    );

    (status_code, Json(report)).into_response()
}
