//! Stream worker error types.
//!
//! Admission errors map to HTTP status codes via the `IntoResponse` impl.
//! Messages returned to callers are generic; the underlying detail (target
//! addresses, transport errors) is logged server-side only.

use crate::lifecycle::InstanceStatus;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Stream worker error type.
///
/// Maps to HTTP status codes:
/// - `MalformedRequest`: 400 Bad Request
/// - `DuplicateSession`, `AlreadyShuttingDown`: 409 Conflict
/// - `NotReady`: 503 Service Unavailable
/// - `TargetUnreachable` and everything internal: 500 Internal Server Error
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Session request could not be decoded or is missing fields.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The session target could not be reached; the session was never registered.
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    /// A session with this id is already registered.
    #[error("Duplicate session: {0}")]
    DuplicateSession(String),

    /// Shutdown has been requested; no new sessions are admitted.
    #[error("Instance is shutting down")]
    AlreadyShuttingDown,

    /// The instance has not finished starting up.
    #[error("Instance is not ready (status {0})")]
    NotReady(InstanceStatus),

    /// A control plane call failed. Logged by the caller, never retried.
    #[error("Control plane notification failed: {0}")]
    NotificationFailure(String),

    /// The transport did not stop within the grace period.
    #[error("Shutdown timed out: {0}")]
    ShutdownTimeout(String),

    /// A status change that would move the state machine backwards or skip a step.
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// The HTTP transport failed while serving or stopping.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Session processing failed after admission.
    #[error("Session processing failed: {0}")]
    Processing(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error")]
    Internal,
}

impl WorkerError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            WorkerError::MalformedRequest(_) => 400,
            WorkerError::DuplicateSession(_) | WorkerError::AlreadyShuttingDown => 409,
            WorkerError::NotReady(_) => 503,
            WorkerError::TargetUnreachable(_)
            | WorkerError::NotificationFailure(_)
            | WorkerError::ShutdownTimeout(_)
            | WorkerError::InvalidTransition { .. }
            | WorkerError::Transport(_)
            | WorkerError::Processing(_)
            | WorkerError::Config(_)
            | WorkerError::Internal => 500,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::MalformedRequest(_) => "malformed_request",
            WorkerError::TargetUnreachable(_) => "target_unreachable",
            WorkerError::DuplicateSession(_) => "duplicate_session",
            WorkerError::AlreadyShuttingDown => "shutting_down",
            WorkerError::NotReady(_) => "not_ready",
            WorkerError::NotificationFailure(_) => "notification_failure",
            WorkerError::ShutdownTimeout(_) => "shutdown_timeout",
            WorkerError::InvalidTransition { .. } => "invalid_transition",
            WorkerError::Transport(_) => "transport",
            WorkerError::Processing(_) => "processing",
            WorkerError::Config(_) => "config",
            WorkerError::Internal => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            WorkerError::MalformedRequest(reason) => (
                StatusCode::BAD_REQUEST,
                "MALFORMED_REQUEST",
                reason.clone(),
            ),
            WorkerError::TargetUnreachable(detail) => {
                // Target address and dial error stay server-side
                tracing::warn!(target: "sw.http", detail = %detail, "Session target unreachable");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TARGET_UNREACHABLE",
                    "Unable to connect to stream".to_string(),
                )
            }
            WorkerError::DuplicateSession(id) => (
                StatusCode::CONFLICT,
                "DUPLICATE_SESSION",
                format!("Session {id} is already active"),
            ),
            WorkerError::AlreadyShuttingDown => (
                StatusCode::CONFLICT,
                "SHUTTING_DOWN",
                "Instance is shutting down and not accepting sessions".to_string(),
            ),
            WorkerError::NotReady(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "NOT_READY",
                "Instance is not ready to accept sessions".to_string(),
            ),
            other => {
                tracing::error!(target: "sw.http", error = %other, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}
