//! Metrics definitions for the stream worker.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sw_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code: `status` (6 instance statuses), `reason`
//! (3 shutdown reasons, or error kinds), `outcome` (3 session outcomes),
//! `endpoint` (3 control plane endpoints). Session ids are never labels.

use crate::lifecycle::{InstanceStatus, ShutdownReason};
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an admitted session.
///
/// Metric: `sw_sessions_admitted_total`
pub fn record_session_admitted() {
    counter!("sw_sessions_admitted_total").increment(1);
}

/// Record a rejected admission.
///
/// Metric: `sw_sessions_rejected_total`
/// Labels: `reason` (error kind, e.g. `shutting_down`)
pub fn record_session_rejected(reason: &'static str) {
    counter!("sw_sessions_rejected_total", "reason" => reason).increment(1);
}

/// Record a finished session.
///
/// Metric: `sw_sessions_completed_total`, `sw_session_duration_seconds`
/// Labels: `outcome` (`success`, `error`, `timeout`)
pub fn record_session_completed(outcome: &'static str, duration: Duration) {
    counter!("sw_sessions_completed_total", "outcome" => outcome).increment(1);
    histogram!("sw_session_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
}

/// Set the number of registered sessions.
///
/// Metric: `sw_active_sessions`
#[allow(clippy::cast_precision_loss)] // Session counts are far below 2^52
pub fn set_active_sessions(count: usize) {
    gauge!("sw_active_sessions").set(count as f64);
}

/// Record a status transition.
///
/// Metric: `sw_status_transitions_total`
/// Labels: `status` (the new status)
pub fn record_status_transition(status: InstanceStatus) {
    counter!("sw_status_transitions_total", "status" => status.as_str()).increment(1);
}

/// Record the reason that started shutdown.
///
/// Metric: `sw_shutdown_reason_total`
/// Labels: `reason`
pub fn record_shutdown_reason(reason: ShutdownReason) {
    counter!("sw_shutdown_reason_total", "reason" => reason.as_str()).increment(1);
}

/// Record a failed control plane call.
///
/// Metric: `sw_notification_failures_total`
/// Labels: `endpoint` (`update_status`, `notify`, `complete`)
pub fn record_notification_failure(endpoint: &'static str) {
    counter!("sw_notification_failures_total", "endpoint" => endpoint).increment(1);
}
