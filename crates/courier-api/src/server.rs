//! HTTP server configuration and request routing.
//!
//! Provides the Axum router for the monitoring surface consumed by
//! operators: backlog stats, recent activity, dead-letter inspection and
//! reprocessing, and the health probe. Requests flow through request-id
//! injection, tracing, and a timeout layer.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use courier_delivery::{DeadLetterService, HealthService, StatsService};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::handlers;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Backlog and activity counters.
    pub stats: Arc<StatsService>,
    /// Threshold-based health evaluation.
    pub health: Arc<HealthService>,
    /// Dead-letter listing and reprocessing.
    pub dead_letters: Arc<DeadLetterService>,
}

/// Creates the Axum router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(handlers::get_stats))
        .route("/activity", get(handlers::get_activity))
        .route("/dead-letter", get(handlers::list_dead_letters))
        .route("/dead-letter/reprocess", post(handlers::reprocess_dead_letters))
        .route("/health", get(handlers::health_check))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware to inject a request id into all responses.
///
/// Adds an `X-Request-Id` header for tracing requests across services.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Starts the HTTP server and serves until the process shuts down.
///
/// # Errors
///
/// Returns `std::io::Error` if the port is already in use or the network
/// interface is unavailable.
pub async fn start_server(state: AppState, addr: SocketAddr) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("monitoring API listening on {}", actual_addr);

    axum::serve(listener, app).await?;

    info!("monitoring API stopped");
    Ok(())
}
