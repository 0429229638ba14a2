//! HTTP routes for the stream worker.
//!
//! Defines the Axum router and application state.

use crate::handlers;
use crate::lifecycle::ShutdownCoordinator;
use crate::observability::{health_router, HealthState};
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Upper bound on one HTTP request, including dialing a session target.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ShutdownCoordinator>,

    /// Liveness and readiness, flipped by the coordinator.
    pub health: Arc<HealthState>,

    /// Renders the Prometheus exposition for `/metrics`.
    pub metrics: PrometheusHandle,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `POST /stream` - Admit a session
/// - `GET /status` - Lifecycle status and active session count
/// - `GET /health`, `GET /ready` - Liveness and readiness probes
/// - `GET /metrics` - Prometheus metrics
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(state: Arc<AppState>) -> Router {
    let metrics_handle = state.metrics.clone();
    let metrics_router = Router::new().route(
        "/metrics",
        get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }),
    );

    let health_routes = health_router(Arc::clone(&state.health));

    let api_routes = Router::new()
        .route("/stream", post(handlers::submit_session))
        .route("/status", get(handlers::get_status))
        .with_state(state);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer - Timeout the request (innermost)
    // 2. TraceLayer - Log request details
    api_routes
        .merge(health_routes)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}
