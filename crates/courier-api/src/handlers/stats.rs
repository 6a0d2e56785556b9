//! Backlog stats and activity handlers.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::instrument;

use super::internal_error;
use crate::AppState;

/// Query parameters for the activity window.
#[derive(Debug, Deserialize)]
pub struct ActivityParams {
    /// Trailing window size in hours.
    #[serde(default = "default_hours")]
    pub hours: u32,
}

fn default_hours() -> u32 {
    24
}

/// `GET /stats`: current backlog counts.
#[instrument(name = "get_stats", skip(state))]
pub async fn get_stats(State(state): State<AppState>) -> Response {
    match state.stats.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /activity?hours`: per-type counts over the trailing window.
#[instrument(name = "get_activity", skip(state))]
pub async fn get_activity(
    State(state): State<AppState>,
    Query(params): Query<ActivityParams>,
) -> Response {
    let hours = params.hours.clamp(1, 24 * 30);

    match state.stats.activity(hours).await {
        Ok(entries) => Json(serde_json::json!({
            "hours": hours,
            "activity": entries,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}
