//! Instance status handler.
//!
//! - `GET /status` - Current lifecycle status and number of active sessions

use crate::lifecycle::InstanceStatus;
use crate::routes::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

/// Response body for `GET /status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub status: InstanceStatus,
    pub active_sessions: usize,
}

/// Handler for GET /status
///
/// Waits behind any in-flight status report, so the returned status is never
/// older than the last one sent to the control plane.
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let status = state.coordinator.status().await;
    let active_sessions = state.coordinator.active_sessions();

    Json(StatusResponse {
        status,
        active_sessions,
    })
}
