//! Competing shutdown timers.
//!
//! Two background tasks race to deliver a [`ShutdownReason`]:
//! - the lifetime timer fires once the configured lifetime has elapsed since
//!   the timers were created (instance start) and cannot be reset;
//! - the inactivity timer fires once no activity has been recorded for the
//!   configured timeout, and restarts its countdown on every activity.
//!
//! Both deliver into a single-slot channel with `try_send`, so a losing fire
//! is absorbed instead of blocking. Once the first reason is consumed the
//! timers are cancelled and their tasks joined.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the instance is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownReason {
    /// No new session was admitted within the inactivity timeout.
    Usage,
    /// The instance reached its maximum lifetime.
    Lifetime,
    /// The process received a termination signal.
    Signal,
}

impl ShutdownReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownReason::Usage => "usage",
            ShutdownReason::Lifetime => "lifetime",
            ShutdownReason::Signal => "signal",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stand-in for deadlines too far out to represent, roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, clamped to [`FAR_FUTURE`] when the sum overflows.
fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Offer `reason` to the single delivery slot without blocking.
fn deliver(sender: &mpsc::Sender<ShutdownReason>, reason: ShutdownReason) -> bool {
    match sender.try_send(reason) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!(
                target: "sw.lifecycle.timers",
                reason = %reason,
                "Shutdown reason already pending, absorbing"
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(
                target: "sw.lifecycle.timers",
                reason = %reason,
                "Shutdown reason already consumed, absorbing"
            );
            false
        }
    }
}

/// Restarts the inactivity countdown.
#[derive(Debug, Clone)]
pub struct ActivityHandle {
    activity: Arc<Notify>,
}

impl ActivityHandle {
    /// Record activity. Resets after the inactivity timer has fired are no-ops.
    pub fn record_activity(&self) {
        self.activity.notify_one();
    }
}

/// Delivers an externally triggered reason (e.g. SIGTERM) through the same
/// single slot as the timers, so it competes with them on equal terms.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    sender: mpsc::Sender<ShutdownReason>,
}

impl ShutdownTrigger {
    /// Offer `reason`. Returns `false` if another reason got there first.
    pub fn fire(&self, reason: ShutdownReason) -> bool {
        deliver(&self.sender, reason)
    }
}

/// The lifetime and inactivity timers plus their shared delivery slot.
#[derive(Debug)]
pub struct ShutdownTimers {
    started_at: Instant,
    lifetime: Duration,
    inactivity_timeout: Duration,
    sender: mpsc::Sender<ShutdownReason>,
    receiver: mpsc::Receiver<ShutdownReason>,
    activity: Arc<Notify>,
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ShutdownTimers {
    /// Create the timers. The lifetime is measured from this call; the
    /// countdowns only run once [`start`](Self::start) is called.
    #[must_use]
    pub fn new(lifetime: Duration, inactivity_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            started_at: Instant::now(),
            lifetime,
            inactivity_timeout,
            sender,
            receiver,
            activity: Arc::new(Notify::new()),
            cancel_token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn activity_handle(&self) -> ActivityHandle {
        ActivityHandle {
            activity: Arc::clone(&self.activity),
        }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            sender: self.sender.clone(),
        }
    }

    /// Spawn both timer tasks. Calling this more than once has no effect.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }

        info!(
            target: "sw.lifecycle.timers",
            lifetime_secs = self.lifetime.as_secs(),
            inactivity_timeout_secs = self.inactivity_timeout.as_secs(),
            "Starting shutdown timers"
        );

        let deadline = deadline_after(self.started_at, self.lifetime);
        let lifetime = self.lifetime;
        let sender = self.sender.clone();
        let cancel_token = self.cancel_token.child_token();
        self.tasks.push(tokio::spawn(async move {
            run_lifetime_timer(deadline, lifetime, sender, cancel_token).await;
        }));

        let timeout = self.inactivity_timeout;
        let first_deadline = deadline_after(self.started_at, timeout);
        let activity = Arc::clone(&self.activity);
        let sender = self.sender.clone();
        let cancel_token = self.cancel_token.child_token();
        self.tasks.push(tokio::spawn(async move {
            run_inactivity_timer(first_deadline, timeout, activity, sender, cancel_token).await;
        }));
    }

    /// Wait for the first reason, then stop both timers.
    ///
    /// Returns `None` only if the timers were never started and every
    /// [`ShutdownTrigger`] has been dropped.
    pub async fn wait_first(self) -> Option<ShutdownReason> {
        let ShutdownTimers {
            sender,
            mut receiver,
            cancel_token,
            tasks,
            ..
        } = self;
        drop(sender);

        let reason = receiver.recv().await;
        cancel_token.cancel();
        receiver.close();

        for task in tasks {
            if let Err(e) = task.await {
                warn!(target: "sw.lifecycle.timers", error = %e, "Timer task failed");
            }
        }

        if let Some(reason) = reason {
            info!(target: "sw.lifecycle.timers", reason = %reason, "Shutdown reason received");
        }
        reason
    }
}

async fn run_lifetime_timer(
    deadline: Instant,
    lifetime: Duration,
    sender: mpsc::Sender<ShutdownReason>,
    cancel_token: CancellationToken,
) {
    tokio::select! {
        () = cancel_token.cancelled() => {}
        () = tokio::time::sleep_until(deadline) => {
            info!(
                target: "sw.lifecycle.timers",
                lifetime_secs = lifetime.as_secs(),
                "Instance lifetime reached"
            );
            deliver(&sender, ShutdownReason::Lifetime);
        }
    }
}

async fn run_inactivity_timer(
    first_deadline: Instant,
    timeout: Duration,
    activity: Arc<Notify>,
    sender: mpsc::Sender<ShutdownReason>,
    cancel_token: CancellationToken,
) {
    let sleep = tokio::time::sleep_until(first_deadline);
    tokio::pin!(sleep);

    // The reset and the fire are both handled by this one loop, so a reset
    // can never race a fire that has already happened.
    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => return,
            () = activity.notified() => {
                sleep.as_mut().reset(deadline_after(Instant::now(), timeout));
            }
            () = &mut sleep => {
                info!(
                    target: "sw.lifecycle.timers",
                    inactivity_timeout_secs = timeout.as_secs(),
                    "No new sessions within inactivity timeout"
                );
                deliver(&sender, ShutdownReason::Usage);
                return;
            }
        }
    }
}
