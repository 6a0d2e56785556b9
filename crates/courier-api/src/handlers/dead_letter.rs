//! Dead-letter inspection and reprocessing handlers.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use courier_core::EventRecord;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::internal_error;
use crate::AppState;

/// Query parameters for the dead-letter listing.
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// 1-based page number.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    50
}

/// Query parameters for reprocessing.
#[derive(Debug, Deserialize)]
pub struct ReprocessParams {
    /// Maximum records to republish.
    #[serde(default = "default_reprocess_limit")]
    pub limit: i64,
}

fn default_reprocess_limit() -> i64 {
    10
}

/// Operator-facing view of a quarantined record.
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    /// Record id.
    pub id: i64,
    /// Original event kind.
    pub event_type: String,
    /// Original payload.
    pub payload: serde_json::Value,
    /// Why the event was quarantined.
    pub error: Option<String>,
    /// Retries consumed before quarantine.
    pub retry_count: i32,
    /// When the event was quarantined.
    pub dead_lettered_at: Option<DateTime<Utc>>,
    /// When the event was first published.
    pub created_at: DateTime<Utc>,
}

impl From<EventRecord> for DeadLetterView {
    fn from(record: EventRecord) -> Self {
        Self {
            id: record.id.0,
            event_type: record.event_type.to_string(),
            payload: record.payload,
            error: record.last_error,
            retry_count: record.retry_count,
            dead_lettered_at: record.dead_lettered_at,
            created_at: record.created_at,
        }
    }
}

/// `GET /dead-letter?page&limit`: paginated quarantine listing.
#[instrument(name = "list_dead_letters", skip(state))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Response {
    match state.dead_letters.list(params.page, params.limit).await {
        Ok(records) => {
            let items: Vec<DeadLetterView> =
                records.into_iter().map(DeadLetterView::from).collect();

            Json(serde_json::json!({
                "page": params.page.max(1),
                "count": items.len(),
                "items": items,
            }))
            .into_response()
        },
        Err(e) => internal_error(e),
    }
}

/// `POST /dead-letter/reprocess?limit`: republish quarantined records.
#[instrument(name = "reprocess_dead_letters", skip(state))]
pub async fn reprocess_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ReprocessParams>,
) -> Response {
    match state.dead_letters.reprocess(params.limit).await {
        Ok(republished) => Json(serde_json::json!({
            "requested": params.limit,
            "republished": republished,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}
