//! Shutdown coordinator.
//!
//! Owns the instance lifecycle end to end:
//!
//! 1. `Inactive → Starting` on process start ([`ShutdownCoordinator::begin_startup`])
//! 2. `Starting → Running` once the listener is serving ([`ShutdownCoordinator::confirm_startup`])
//! 3. `Running → ShutdownRequested` on the first shutdown reason
//! 4. `ShutdownRequested → ShuttingDown` once every session has completed
//! 5. `ShuttingDown → ShutdownFailed` if the transport does not stop within
//!    the grace period
//!
//! Admission checks the status and registers the session under the status
//! lock, the same lock that performs step 3, so no session can be admitted
//! after shutdown has been requested.

use super::sessions::{Session, SessionGuard, SessionRegistry};
use super::status::{InstanceStatus, StatusRegister};
use super::timers::{ActivityHandle, ShutdownReason, ShutdownTimers, ShutdownTrigger};
use crate::control_plane::{ControlPlaneNotifier, StatusExtra, SHUTDOWN_FAILED_EVENT};
use crate::errors::WorkerError;
use crate::observability::{metrics, HealthState};
use crate::stream::{StreamProcessor, TargetConnection};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Default maximum instance lifetime (6 hours).
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(6 * 60 * 60);

/// Default inactivity timeout (15 minutes).
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default grace period for stopping the transport.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Timing parameters for one instance lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    pub lifetime: Duration,
    pub inactivity_timeout: Duration,
    pub grace_period: Duration,
    /// Upper bound on one session's processing. `None` waits indefinitely.
    pub max_session_duration: Option<Duration>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            lifetime: DEFAULT_LIFETIME,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_session_duration: None,
        }
    }
}

/// Control plane failures are logged and never stop the lifecycle.
fn absorb_notification_failure(
    result: Result<(), WorkerError>,
    status: InstanceStatus,
) -> Result<(), WorkerError> {
    match result {
        Err(WorkerError::NotificationFailure(detail)) => {
            warn!(
                target: "sw.lifecycle.coordinator",
                status = %status,
                error = %detail,
                "Status applied locally but control plane was not notified"
            );
            Ok(())
        }
        other => other,
    }
}

/// Orchestrates admission, shutdown triggering, drain and final shutdown.
pub struct ShutdownCoordinator {
    instance_id: String,
    status: StatusRegister,
    sessions: SessionRegistry,
    notifier: Arc<dyn ControlPlaneNotifier>,
    processor: Arc<dyn StreamProcessor>,
    health: Arc<HealthState>,
    settings: LifecycleSettings,
    activity: ActivityHandle,
    trigger: ShutdownTrigger,
}

impl ShutdownCoordinator {
    /// Create a coordinator and the timers it will race.
    ///
    /// The lifetime is measured from this call. The timers are returned
    /// unstarted; start them once the instance is `Starting` and pass them to
    /// [`run`](Self::run).
    pub fn new(
        instance_id: impl Into<String>,
        settings: LifecycleSettings,
        notifier: Arc<dyn ControlPlaneNotifier>,
        processor: Arc<dyn StreamProcessor>,
        health: Arc<HealthState>,
    ) -> (Arc<Self>, ShutdownTimers) {
        let timers = ShutdownTimers::new(settings.lifetime, settings.inactivity_timeout);

        let coordinator = Arc::new(Self {
            instance_id: instance_id.into(),
            status: StatusRegister::new(),
            sessions: SessionRegistry::new(),
            notifier,
            processor,
            health,
            settings,
            activity: timers.activity_handle(),
            trigger: timers.trigger(),
        });

        (coordinator, timers)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Current status. Waits behind an in-flight status report.
    pub async fn status(&self) -> InstanceStatus {
        self.status.get().await
    }

    /// Number of registered sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.count()
    }

    /// Snapshot of registered sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.list()
    }

    /// Handle for delivering an external shutdown reason (e.g. a signal).
    pub fn trigger(&self) -> ShutdownTrigger {
        self.trigger.clone()
    }

    async fn advance(&self, next: InstanceStatus, extra: &StatusExtra) -> Result<(), WorkerError> {
        let result = self.status.set(next, &*self.notifier, extra).await;
        absorb_notification_failure(result, next)
    }

    /// `Inactive → Starting`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InvalidTransition` if startup has already begun.
    pub async fn begin_startup(&self) -> Result<(), WorkerError> {
        info!(
            target: "sw.lifecycle.coordinator",
            instance_id = %self.instance_id,
            "Instance starting"
        );
        self.advance(InstanceStatus::Starting, &StatusExtra::new())
            .await
    }

    /// `Starting → Running`; the instance begins admitting sessions.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InvalidTransition` if the instance is not
    /// `Starting`, e.g. because shutdown was requested during startup.
    pub async fn confirm_startup(&self) -> Result<(), WorkerError> {
        let mut status = self.status.lock().await;
        let result = status
            .set(InstanceStatus::Running, &*self.notifier, &StatusExtra::new())
            .await;
        absorb_notification_failure(result, InstanceStatus::Running)?;

        // Flipped under the status lock so it cannot overtake a shutdown request
        self.health.set_ready();
        info!(
            target: "sw.lifecycle.coordinator",
            instance_id = %self.instance_id,
            "Instance running, admitting sessions"
        );
        Ok(())
    }

    /// Admit a new session.
    ///
    /// The target is dialed before the session is registered, without holding
    /// any lock. Registration itself happens under the status lock and only
    /// while the instance is `Running`. On success the session is processed on
    /// its own task and the inactivity countdown restarts.
    ///
    /// # Errors
    ///
    /// - `WorkerError::MalformedRequest` if `id` or `target` is blank
    /// - `WorkerError::NotReady` before the instance is `Running`
    /// - `WorkerError::AlreadyShuttingDown` once shutdown has been requested
    /// - `WorkerError::DuplicateSession` if `id` is already registered
    /// - `WorkerError::TargetUnreachable` if the target cannot be dialed
    #[instrument(skip_all, fields(session_id = %id))]
    pub async fn admit(self: &Arc<Self>, id: &str, target: &str) -> Result<Session, WorkerError> {
        match self.try_admit(id, target).await {
            Ok(session) => {
                metrics::record_session_admitted();
                info!(
                    target: "sw.lifecycle.coordinator",
                    session_id = %session.id,
                    active_sessions = self.sessions.count(),
                    "Session admitted"
                );
                Ok(session)
            }
            Err(e) => {
                metrics::record_session_rejected(e.kind());
                debug!(
                    target: "sw.lifecycle.coordinator",
                    reason = e.kind(),
                    "Session rejected"
                );
                Err(e)
            }
        }
    }

    async fn try_admit(self: &Arc<Self>, id: &str, target: &str) -> Result<Session, WorkerError> {
        if id.trim().is_empty() {
            return Err(WorkerError::MalformedRequest(
                "Session id must not be empty".to_string(),
            ));
        }
        if target.trim().is_empty() {
            return Err(WorkerError::MalformedRequest(
                "Session target must not be empty".to_string(),
            ));
        }

        // Cheap rejections before dialing; rechecked under the lock below
        check_admissible(self.status.get().await)?;
        if self.sessions.contains(id) {
            return Err(WorkerError::DuplicateSession(id.to_string()));
        }

        let connection = self.processor.connect(target).await?;

        let guard = {
            let status = self.status.lock().await;
            check_admissible(status.current())?;
            self.sessions.add(id, target)?
        };
        self.activity.record_activity();

        let session = guard.session().clone();
        tokio::spawn(Arc::clone(self).run_session(guard, connection));
        Ok(session)
    }

    /// Process one session, then deregister it and report completion.
    ///
    /// The guard is dropped last, so drain does not observe the session as
    /// finished until its completion has been reported.
    async fn run_session(self: Arc<Self>, guard: SessionGuard, connection: TargetConnection) {
        let session = guard.session().clone();
        let started = Instant::now();

        let processing = self.processor.process(&session, connection);
        let result = match self.settings.max_session_duration {
            Some(limit) => tokio::time::timeout(limit, processing).await.ok(),
            None => Some(processing.await),
        };

        let outcome = match result {
            Some(Ok(bytes)) => {
                info!(
                    target: "sw.lifecycle.coordinator",
                    session_id = %session.id,
                    bytes,
                    "Session completed"
                );
                "success"
            }
            Some(Err(e)) => {
                warn!(
                    target: "sw.lifecycle.coordinator",
                    session_id = %session.id,
                    error = %e,
                    "Session processing failed"
                );
                "error"
            }
            None => {
                warn!(
                    target: "sw.lifecycle.coordinator",
                    session_id = %session.id,
                    max_session_secs = self.settings.max_session_duration.map(|d| d.as_secs()),
                    "Session exceeded maximum duration, abandoning"
                );
                "timeout"
            }
        };
        metrics::record_session_completed(outcome, started.elapsed());

        guard.remove();
        if let Err(e) = self.notifier.report_session_complete(&session.id).await {
            metrics::record_notification_failure("complete");
            warn!(
                target: "sw.lifecycle.coordinator",
                session_id = %session.id,
                error = %e,
                "Failed to report session completion"
            );
        }
        drop(guard);
    }

    /// `Running → ShutdownRequested` with `reason`.
    ///
    /// Only the first call has any effect; later calls return `false`. Once
    /// this returns `true`, every admission is rejected.
    pub async fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        let mut status = self.status.lock().await;
        if status.current().is_shutting_down() {
            debug!(
                target: "sw.lifecycle.coordinator",
                reason = %reason,
                "Shutdown already requested, ignoring"
            );
            return false;
        }

        info!(
            target: "sw.lifecycle.coordinator",
            reason = %reason,
            active_sessions = self.sessions.count(),
            "Requesting shutdown"
        );
        self.health.set_not_ready();
        metrics::record_shutdown_reason(reason);

        let extra = StatusExtra::from([("reason".to_string(), reason.as_str().to_string())]);
        let result = status
            .set(InstanceStatus::ShutdownRequested, &*self.notifier, &extra)
            .await;
        if let Err(e) = absorb_notification_failure(result, InstanceStatus::ShutdownRequested) {
            error!(
                target: "sw.lifecycle.coordinator",
                error = %e,
                "Failed to request shutdown"
            );
            return false;
        }
        true
    }

    /// Wait for every session to complete, then `ShutdownRequested → ShuttingDown`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::InvalidTransition` if shutdown was never requested.
    pub async fn drain(&self) -> Result<(), WorkerError> {
        let active = self.sessions.count();
        if active > 0 {
            info!(
                target: "sw.lifecycle.coordinator",
                active_sessions = active,
                "Waiting for sessions to complete"
            );
        }

        self.sessions.drain().await;

        info!(target: "sw.lifecycle.coordinator", "All sessions complete, shutting down");
        self.advance(InstanceStatus::ShuttingDown, &StatusExtra::new())
            .await
    }

    /// Stop the transport within the grace period.
    ///
    /// A transport error or timeout moves the instance to `ShutdownFailed`,
    /// fails liveness and reports a `"Server Shutdown Failed"` event. Returns the final status;
    /// the caller exits either way.
    pub async fn finish<F>(&self, stop_transport: F) -> InstanceStatus
    where
        F: Future<Output = Result<(), WorkerError>>,
    {
        let grace = self.settings.grace_period;
        let result = match tokio::time::timeout(grace, stop_transport).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::ShutdownTimeout(format!(
                "transport did not stop within {}s",
                grace.as_secs()
            ))),
        };

        if let Err(e) = result {
            error!(
                target: "sw.lifecycle.coordinator",
                error = %e,
                "Server shutdown failed"
            );
            self.health.set_not_live();

            if let Err(status_err) = self
                .advance(InstanceStatus::ShutdownFailed, &StatusExtra::new())
                .await
            {
                warn!(
                    target: "sw.lifecycle.coordinator",
                    error = %status_err,
                    "Could not mark shutdown as failed"
                );
            }

            if let Err(notify_err) = self
                .notifier
                .report_event(SHUTDOWN_FAILED_EVENT, &e.to_string())
                .await
            {
                metrics::record_notification_failure("notify");
                warn!(
                    target: "sw.lifecycle.coordinator",
                    error = %notify_err,
                    "Failed to report shutdown failure"
                );
            }
        } else {
            info!(target: "sw.lifecycle.coordinator", "Server exited");
        }

        self.status.get().await
    }

    /// Drive the instance from `Running` to exit.
    ///
    /// Waits for the first shutdown reason from `timers` (or a
    /// [`ShutdownTrigger`]), requests shutdown, drains, then stops the
    /// transport via `stop_transport`. Returns the final status.
    pub async fn run<F>(&self, timers: ShutdownTimers, stop_transport: F) -> InstanceStatus
    where
        F: Future<Output = Result<(), WorkerError>>,
    {
        // The coordinator holds a trigger itself, so the slot never closes
        // while it waits
        match timers.wait_first().await {
            Some(reason) => {
                self.request_shutdown(reason).await;
            }
            None => {
                warn!(target: "sw.lifecycle.coordinator", "Shutdown timers stopped without a reason");
                self.request_shutdown(ShutdownReason::Signal).await;
            }
        }

        if let Err(e) = self.drain().await {
            warn!(target: "sw.lifecycle.coordinator", error = %e, "Drain did not complete cleanly");
        }

        self.finish(stop_transport).await
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("instance_id", &self.instance_id)
            .field("settings", &self.settings)
            .field("active_sessions", &self.sessions.count())
            .finish_non_exhaustive()
    }
}

/// Only a `Running` instance admits sessions.
fn check_admissible(status: InstanceStatus) -> Result<(), WorkerError> {
    match status {
        InstanceStatus::Running => Ok(()),
        s if s.is_shutting_down() => Err(WorkerError::AlreadyShuttingDown),
        s => Err(WorkerError::NotReady(s)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::control_plane::mock::{NotifierCall, RecordingNotifier};
    use crate::stream::mock::GatedProcessor;

    struct Fixture {
        coordinator: Arc<ShutdownCoordinator>,
        timers: ShutdownTimers,
        notifier: Arc<RecordingNotifier>,
        processor: Arc<GatedProcessor>,
        health: Arc<HealthState>,
    }

    fn fixture(settings: LifecycleSettings) -> Fixture {
        let notifier = Arc::new(RecordingNotifier::new());
        let processor = Arc::new(GatedProcessor::new());
        let health = Arc::new(HealthState::new());
        let (coordinator, timers) = ShutdownCoordinator::new(
            "sw-test",
            settings,
            Arc::clone(&notifier) as Arc<dyn ControlPlaneNotifier>,
            Arc::clone(&processor) as Arc<dyn StreamProcessor>,
            Arc::clone(&health),
        );
        Fixture {
            coordinator,
            timers,
            notifier,
            processor,
            health,
        }
    }

    async fn running(settings: LifecycleSettings) -> Fixture {
        let f = fixture(settings);
        f.coordinator.begin_startup().await.unwrap();
        f.coordinator.confirm_startup().await.unwrap();
        f
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_check_admissible() {
        assert!(check_admissible(InstanceStatus::Running).is_ok());
        assert!(matches!(
            check_admissible(InstanceStatus::Starting),
            Err(WorkerError::NotReady(InstanceStatus::Starting))
        ));
        for status in [
            InstanceStatus::ShutdownRequested,
            InstanceStatus::ShuttingDown,
            InstanceStatus::ShutdownFailed,
        ] {
            assert!(matches!(
                check_admissible(status),
                Err(WorkerError::AlreadyShuttingDown)
            ));
        }
    }

    #[tokio::test]
    async fn test_startup_reports_and_flips_readiness() {
        let f = fixture(LifecycleSettings::default());
        assert!(!f.health.is_ready());

        f.coordinator.begin_startup().await.unwrap();
        assert!(!f.health.is_ready());
        f.coordinator.confirm_startup().await.unwrap();

        assert!(f.health.is_ready());
        assert_eq!(f.coordinator.status().await, InstanceStatus::Running);
        assert_eq!(
            f.notifier.statuses(),
            vec![InstanceStatus::Starting, InstanceStatus::Running]
        );
    }

    #[tokio::test]
    async fn test_admit_before_running_is_not_ready() {
        let f = fixture(LifecycleSettings::default());
        f.coordinator.begin_startup().await.unwrap();

        let result = f.coordinator.admit("a", "t").await;

        assert!(matches!(result, Err(WorkerError::NotReady(InstanceStatus::Starting))));
        assert_eq!(f.processor.connects(), 0, "must not dial before Running");
    }

    #[tokio::test]
    async fn test_admit_rejects_blank_fields() {
        let f = running(LifecycleSettings::default()).await;

        assert!(matches!(
            f.coordinator.admit("", "t").await,
            Err(WorkerError::MalformedRequest(_))
        ));
        assert!(matches!(
            f.coordinator.admit("a", "  ").await,
            Err(WorkerError::MalformedRequest(_))
        ));
        assert_eq!(f.coordinator.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected_without_dialing() {
        let f = running(LifecycleSettings::default()).await;
        f.coordinator.admit("a", "t").await.unwrap();

        let result = f.coordinator.admit("a", "t").await;

        assert!(matches!(result, Err(WorkerError::DuplicateSession(_))));
        assert_eq!(f.processor.connects(), 1);
        assert_eq!(f.coordinator.active_sessions(), 1);
        f.processor.release_all();
    }

    #[tokio::test]
    async fn test_completed_session_is_removed_and_reported() {
        let f = running(LifecycleSettings::default()).await;

        let session = f.coordinator.admit("a", "t").await.unwrap();
        assert_eq!(session.id, "a");
        assert_eq!(session.target, "t");
        assert_eq!(f.coordinator.active_sessions(), 1);

        f.processor.release("a");
        while f.coordinator.active_sessions() > 0 || f.notifier.completed_sessions().is_empty() {
            settle().await;
        }

        assert_eq!(f.notifier.completed_sessions(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_processing_still_removes_and_reports() {
        let f = running(LifecycleSettings::default()).await;
        f.processor.set_failing("a");
        f.coordinator.admit("a", "t").await.unwrap();

        f.processor.release("a");
        f.coordinator.request_shutdown(ShutdownReason::Signal).await;
        f.coordinator.drain().await.unwrap();

        assert_eq!(f.coordinator.active_sessions(), 0);
        assert_eq!(f.notifier.completed_sessions(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_request_shutdown_is_idempotent() {
        let f = running(LifecycleSettings::default()).await;

        assert!(f.coordinator.request_shutdown(ShutdownReason::Lifetime).await);
        assert!(!f.coordinator.request_shutdown(ShutdownReason::Usage).await);

        let requests: Vec<_> = f
            .notifier
            .calls()
            .into_iter()
            .filter(|call| {
                matches!(call, NotifierCall::Status { status, .. } if *status == InstanceStatus::ShutdownRequested)
            })
            .collect();
        assert_eq!(
            requests,
            vec![NotifierCall::Status {
                status: InstanceStatus::ShutdownRequested,
                extra: StatusExtra::from([("reason".to_string(), "lifetime".to_string())]),
            }]
        );
        assert!(!f.health.is_ready());
    }

    #[tokio::test]
    async fn test_notification_failure_never_blocks_shutdown() {
        let f = running(LifecycleSettings::default()).await;
        f.notifier.set_failing(true);
        f.coordinator.admit("a", "t").await.unwrap();
        f.processor.release("a");

        assert!(f.coordinator.request_shutdown(ShutdownReason::Usage).await);
        f.coordinator.drain().await.unwrap();
        let status = f.coordinator.finish(async { Ok(()) }).await;

        assert_eq!(status, InstanceStatus::ShuttingDown);
        assert_eq!(
            f.notifier.statuses(),
            vec![
                InstanceStatus::Starting,
                InstanceStatus::Running,
                InstanceStatus::ShutdownRequested,
                InstanceStatus::ShuttingDown,
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_before_request_is_rejected() {
        let f = running(LifecycleSettings::default()).await;

        let result = f.coordinator.drain().await;

        assert!(matches!(
            result,
            Err(WorkerError::InvalidTransition {
                from: InstanceStatus::Running,
                to: InstanceStatus::ShuttingDown,
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_marks_shutdown_failed() {
        let f = running(LifecycleSettings::default()).await;
        f.coordinator.request_shutdown(ShutdownReason::Signal).await;
        f.coordinator.drain().await.unwrap();

        let status = f
            .coordinator
            .finish(async { Err(WorkerError::Internal) })
            .await;

        assert_eq!(status, InstanceStatus::ShutdownFailed);
        assert!(!f.health.is_live());
        assert_eq!(
            f.notifier.events(),
            vec![(SHUTDOWN_FAILED_EVENT.to_string(), "Internal error".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_session_duration_abandons_session() {
        let settings = LifecycleSettings {
            max_session_duration: Some(Duration::from_secs(30)),
            ..LifecycleSettings::default()
        };
        let f = running(settings).await;
        f.coordinator.admit("a", "t").await.unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        settle().await;

        assert_eq!(f.coordinator.active_sessions(), 0);
        assert_eq!(f.notifier.completed_sessions(), vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_resets_inactivity_timer() {
        let settings = LifecycleSettings {
            inactivity_timeout: Duration::from_secs(60),
            ..LifecycleSettings::default()
        };
        let mut f = running(settings).await;
        f.timers.start();
        let start = Instant::now();

        tokio::time::sleep(Duration::from_secs(45)).await;
        f.coordinator.admit("a", "t").await.unwrap();
        f.processor.release("a");

        let reason = f.timers.wait_first().await;

        assert_eq!(reason, Some(ShutdownReason::Usage));
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(105) && elapsed < Duration::from_secs(106),
            "inactivity should be measured from the admission, got {elapsed:?}"
        );
    }
}
