//! Instance status state machine.
//!
//! `StatusRegister` owns the current [`InstanceStatus`] behind an async mutex.
//! Every change is reported to the control plane while the lock is held, so
//! a concurrent reader never sees a status newer than the last report attempt.

use crate::control_plane::{ControlPlaneNotifier, StatusExtra};
use crate::errors::WorkerError;
use crate::observability::metrics;
use serde::Serialize;
use std::fmt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Lifecycle status of this instance.
///
/// Moves strictly forward:
/// `Inactive → Starting → Running → ShutdownRequested → ShuttingDown → ShutdownFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum InstanceStatus {
    Inactive,
    Starting,
    Running,
    ShutdownRequested,
    ShuttingDown,
    ShutdownFailed,
}

impl InstanceStatus {
    /// Wire name reported to the control plane and the status endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Inactive => "Inactive",
            InstanceStatus::Starting => "Starting",
            InstanceStatus::Running => "Running",
            InstanceStatus::ShutdownRequested => "ShutdownRequested",
            InstanceStatus::ShuttingDown => "ShuttingDown",
            InstanceStatus::ShutdownFailed => "ShutdownFailed",
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Transitions only move forward. `ShuttingDown` is only reachable from
    /// `ShutdownRequested`, and `ShutdownFailed` only from `ShuttingDown`.
    pub fn can_advance_to(self, next: InstanceStatus) -> bool {
        if next <= self {
            return false;
        }
        match next {
            InstanceStatus::ShuttingDown => self == InstanceStatus::ShutdownRequested,
            InstanceStatus::ShutdownFailed => self == InstanceStatus::ShuttingDown,
            _ => true,
        }
    }

    /// Whether shutdown has been requested (or is further along).
    pub fn is_shutting_down(self) -> bool {
        self >= InstanceStatus::ShutdownRequested
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holds the instance status under mutual exclusion.
#[derive(Debug)]
pub struct StatusRegister {
    current: Mutex<InstanceStatus>,
}

impl Default for StatusRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRegister {
    /// Create a register in the `Inactive` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(InstanceStatus::Inactive),
        }
    }

    /// Current status. Waits behind an in-progress `set`, including its
    /// control plane report.
    pub async fn get(&self) -> InstanceStatus {
        *self.current.lock().await
    }

    /// Acquire exclusive access to the status.
    ///
    /// Used by the coordinator to make "check status" and a dependent action
    /// (registering a session, flipping to `ShutdownRequested`) one atomic step.
    pub async fn lock(&self) -> StatusGuard<'_> {
        StatusGuard {
            current: self.current.lock().await,
        }
    }

    /// Move to `next` and report it to the control plane.
    ///
    /// # Errors
    ///
    /// - `WorkerError::InvalidTransition` if `next` is not a legal successor;
    ///   nothing is applied or reported.
    /// - `WorkerError::NotificationFailure` if the report failed. The new
    ///   status is kept locally regardless.
    pub async fn set(
        &self,
        next: InstanceStatus,
        notifier: &dyn ControlPlaneNotifier,
        extra: &StatusExtra,
    ) -> Result<(), WorkerError> {
        self.lock().await.set(next, notifier, extra).await
    }
}

/// Exclusive access to the instance status.
pub struct StatusGuard<'a> {
    current: MutexGuard<'a, InstanceStatus>,
}

impl StatusGuard<'_> {
    /// Status as of acquiring the guard (or the last `set` through it).
    pub fn current(&self) -> InstanceStatus {
        *self.current
    }

    /// Apply `next` and report it while still holding the lock.
    ///
    /// # Errors
    ///
    /// See [`StatusRegister::set`].
    pub async fn set(
        &mut self,
        next: InstanceStatus,
        notifier: &dyn ControlPlaneNotifier,
        extra: &StatusExtra,
    ) -> Result<(), WorkerError> {
        let from = *self.current;
        if !from.can_advance_to(next) {
            warn!(
                target: "sw.lifecycle.status",
                from = %from,
                to = %next,
                "Rejected invalid status transition"
            );
            return Err(WorkerError::InvalidTransition { from, to: next });
        }

        *self.current = next;
        metrics::record_status_transition(next);
        debug!(target: "sw.lifecycle.status", from = %from, to = %next, "Status changed");

        notifier.report_status(next, extra).await.map_err(|e| {
            metrics::record_notification_failure("update_status");
            e
        })
    }
}
