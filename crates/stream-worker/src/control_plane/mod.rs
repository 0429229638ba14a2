//! Control plane notifications.
//!
//! The control plane is the external orchestrator that owns this instance.
//! It is told about status changes, out-of-band events (currently only a
//! failed transport shutdown) and completed sessions.
//!
//! Every call is best-effort: the caller logs a failure and moves on.
//! Nothing here retries.

mod client;
pub mod mock;

pub use client::{HttpControlPlaneClient, DEFAULT_NOTIFY_TIMEOUT};

use crate::errors::WorkerError;
use crate::lifecycle::InstanceStatus;
use std::collections::BTreeMap;

/// Extra query parameters sent alongside a status report (e.g. `reason`).
pub type StatusExtra = BTreeMap<String, String>;

/// Event reason reported when the transport fails to stop within the grace period.
pub const SHUTDOWN_FAILED_EVENT: &str = "Server Shutdown Failed";

/// Outbound interface to the control plane.
#[async_trait::async_trait]
pub trait ControlPlaneNotifier: Send + Sync {
    /// Report a status change.
    async fn report_status(
        &self,
        status: InstanceStatus,
        extra: &StatusExtra,
    ) -> Result<(), WorkerError>;

    /// Report an out-of-band event.
    async fn report_event(&self, reason: &str, message: &str) -> Result<(), WorkerError>;

    /// Report that a session finished processing.
    async fn report_session_complete(&self, session_id: &str) -> Result<(), WorkerError>;
}
