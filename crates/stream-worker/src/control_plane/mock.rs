//! Recording control plane notifier for testing.
//!
//! Captures every call in order so tests can assert on the exact sequence of
//! status reports, events and session completions.

use super::{ControlPlaneNotifier, StatusExtra};
use crate::errors::WorkerError;
use crate::lifecycle::InstanceStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;

/// One recorded notifier call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierCall {
    Status {
        status: InstanceStatus,
        extra: StatusExtra,
    },
    Event {
        reason: String,
        message: String,
    },
    SessionComplete {
        session_id: String,
    },
}

/// Notifier that records calls instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<NotifierCall>>,
    failing: AtomicBool,
    status_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingNotifier {
    /// Create a notifier whose calls all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier whose calls are recorded but all fail.
    #[must_use]
    pub fn failing() -> Self {
        let notifier = Self::default();
        notifier.set_failing(true);
        notifier
    }

    /// Toggle failure of subsequent calls.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every subsequent status report wait for a permit on the returned
    /// `Notify` before completing.
    pub fn pause_status_reports(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self
            .status_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&gate));
        gate
    }

    /// Release a paused status report and stop pausing later ones.
    pub fn resume_status_reports(&self) {
        let gate = self
            .status_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(gate) = gate {
            gate.notify_one();
        }
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<NotifierCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Statuses reported so far, in order.
    pub fn statuses(&self) -> Vec<InstanceStatus> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotifierCall::Status { status, .. } => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Session ids reported complete so far, in order.
    pub fn completed_sessions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotifierCall::SessionComplete { session_id } => Some(session_id),
                _ => None,
            })
            .collect()
    }

    /// Events reported so far as `(reason, message)`.
    pub fn events(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotifierCall::Event { reason, message } => Some((reason, message)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: NotifierCall) -> Result<(), WorkerError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);

        if self.failing.load(Ordering::SeqCst) {
            Err(WorkerError::NotificationFailure(
                "Mock control plane unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl ControlPlaneNotifier for RecordingNotifier {
    async fn report_status(
        &self,
        status: InstanceStatus,
        extra: &StatusExtra,
    ) -> Result<(), WorkerError> {
        let gate = self
            .status_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.record(NotifierCall::Status {
            status,
            extra: extra.clone(),
        })
    }

    async fn report_event(&self, reason: &str, message: &str) -> Result<(), WorkerError> {
        self.record(NotifierCall::Event {
            reason: reason.to_string(),
            message: message.to_string(),
        })
    }

    async fn report_session_complete(&self, session_id: &str) -> Result<(), WorkerError> {
        self.record(NotifierCall::SessionComplete {
            session_id: session_id.to_string(),
        })
    }
}
