//! Session intake handler.
//!
//! - `POST /stream` - Admit a new session
//!
//! The body is `{"id": "...", "target": "..."}`; `url` is accepted in place
//! of `target`. The target is dialed before the response is sent, so a 200
//! means the session is registered and processing.

use crate::errors::WorkerError;
use crate::lifecycle::Session;
use crate::routes::AppState;
use axum::{extract::rejection::JsonRejection, extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

/// Request body for `POST /stream`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub id: String,
    #[serde(alias = "url")]
    pub target: String,
}

/// Handler for POST /stream
///
/// # Response
///
/// - 200 OK: Session admitted, body is the registered session
/// - 400 Bad Request: Body is not valid JSON or a field is missing or blank
/// - 409 Conflict: Duplicate session id, or shutdown already requested
/// - 500 Internal Server Error: Target unreachable
/// - 503 Service Unavailable: Instance not yet running
#[instrument(skip_all)]
pub async fn submit_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<Session>, WorkerError> {
    let Json(request) = payload.map_err(|rejection| {
        WorkerError::MalformedRequest(format!("Invalid request body: {}", rejection.body_text()))
    })?;

    let session = state
        .coordinator
        .admit(&request.id, &request.target)
        .await?;

    Ok(Json(session))
}
