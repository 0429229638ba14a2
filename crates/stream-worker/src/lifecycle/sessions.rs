//! Registry of active sessions.
//!
//! The session map sits behind its own lock, separate from the status lock,
//! so session churn never serializes status reads. Drain tracking uses a
//! `TaskTracker` as a wait-group: every admitted session holds a tracker token
//! (inside its [`SessionGuard`]) until its completion has been reported.

use crate::errors::WorkerError;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};
use tracing::debug;

/// One admitted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Caller-supplied unique token.
    pub id: String,
    /// Destination the session processes against.
    pub target: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    session: Session,
    serial: u64,
}

#[derive(Debug, Default)]
struct Sessions {
    entries: HashMap<String, Entry>,
    next_serial: u64,
}

#[derive(Debug, Default)]
struct RegistryInner {
    sessions: Mutex<Sessions>,
    tracker: TaskTracker,
}

/// Tracks active sessions by id.
///
/// Cheap to clone; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        // A panic while holding the lock cannot leave the map half-updated
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session.
    ///
    /// The returned guard keeps the session counted for [`drain`](Self::drain)
    /// until it is dropped, and removes the session on drop if it is still
    /// registered.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::DuplicateSession` if `id` is already registered.
    pub fn add(&self, id: &str, target: &str) -> Result<SessionGuard, WorkerError> {
        let mut sessions = self.sessions();
        if sessions.entries.contains_key(id) {
            return Err(WorkerError::DuplicateSession(id.to_string()));
        }

        let serial = sessions.next_serial;
        sessions.next_serial += 1;

        let session = Session {
            id: id.to_string(),
            target: target.to_string(),
            started_at: Utc::now(),
        };
        sessions.entries.insert(
            id.to_string(),
            Entry {
                session: session.clone(),
                serial,
            },
        );
        metrics::set_active_sessions(sessions.entries.len());
        debug!(target: "sw.lifecycle.sessions", session_id = %id, "Session registered");

        Ok(SessionGuard {
            session,
            serial,
            registry: self.clone(),
            _token: self.inner.tracker.token(),
        })
    }

    /// Remove a session by id, returning it if it was registered.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions();
        let removed = sessions.entries.remove(id).map(|entry| entry.session);
        metrics::set_active_sessions(sessions.entries.len());
        removed
    }

    /// Remove `id` only if it is still the registration identified by `serial`.
    fn remove_registration(&self, id: &str, serial: u64) -> Option<Session> {
        let mut sessions = self.sessions();
        let matches = sessions
            .entries
            .get(id)
            .is_some_and(|entry| entry.serial == serial);
        if !matches {
            return None;
        }
        let removed = sessions.entries.remove(id).map(|entry| entry.session);
        metrics::set_active_sessions(sessions.entries.len());
        removed
    }

    /// Number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions().entries.len()
    }

    /// Whether a session with `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.sessions().entries.contains_key(id)
    }

    /// Snapshot of registered sessions.
    pub fn list(&self) -> Vec<Session> {
        self.sessions()
            .entries
            .values()
            .map(|entry| entry.session.clone())
            .collect()
    }

    /// Wait until every registered session has completed.
    ///
    /// Unbounded: returns only once all outstanding [`SessionGuard`]s are
    /// dropped. Sessions added while draining are waited for as well.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

/// Proof of registration for one session.
///
/// Dropping the guard removes the session (if still present) and releases
/// its drain token, so a failed or panicking processing task cannot leave a
/// stale entry behind or block drain forever.
#[derive(Debug)]
pub struct SessionGuard {
    session: Session,
    serial: u64,
    registry: SessionRegistry,
    _token: TaskTrackerToken,
}

impl SessionGuard {
    /// The registered session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Remove this registration from the registry.
    ///
    /// Returns `false` if it was already removed. A later session reusing the
    /// same id is never affected.
    pub fn remove(&self) -> bool {
        self.registry
            .remove_registration(&self.session.id, self.serial)
            .is_some()
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    #[test]
    fn test_add_and_count() {
        let registry = SessionRegistry::new();

        let _a = registry.add("a", "127.0.0.1:1935").unwrap();
        let _b = registry.add("b", "127.0.0.1:1936").unwrap();

        assert_eq!(registry.count(), 2);
        assert!(registry.contains("a"));
        assert!(registry.contains("b"));
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let registry = SessionRegistry::new();
        let _a = registry.add("a", "t1").unwrap();

        let result = registry.add("a", "t2");

        assert!(matches!(result, Err(WorkerError::DuplicateSession(id)) if id == "a"));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.list()[0].target, "t1");
    }

    #[test]
    fn test_dropping_guard_removes_session() {
        let registry = SessionRegistry::new();
        let guard = registry.add("a", "t").unwrap();
        assert_eq!(registry.count(), 1);

        drop(guard);

        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_stale_guard_does_not_remove_reused_id() {
        let registry = SessionRegistry::new();
        let first = registry.add("a", "t1").unwrap();
        assert!(registry.remove("a").is_some());

        let _second = registry.add("a", "t2").unwrap();
        drop(first);

        assert!(registry.contains("a"));
        assert_eq!(registry.list()[0].target, "t2");
    }

    #[test]
    fn test_count_matches_admits_minus_removes_minus_rejections() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let registry = SessionRegistry::new();
            let mut guards = Vec::new();
            let (mut admits, mut removes, mut rejected) = (0usize, 0usize, 0usize);

            for _ in 0..200 {
                let id = format!("s-{}", rng.gen_range(0..40));
                if rng.gen_bool(0.6) {
                    match registry.add(&id, "t") {
                        Ok(guard) => {
                            admits += 1;
                            guards.push(guard);
                        }
                        Err(WorkerError::DuplicateSession(_)) => rejected += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                } else if registry.remove(&id).is_some() {
                    removes += 1;
                }
            }

            // Rejected admits never count, so only successful adds are tallied
            assert_eq!(registry.count(), admits - removes, "rejected = {rejected}");
        }
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_empty() {
        let registry = SessionRegistry::new();

        tokio::time::timeout(Duration::from_secs(1), registry.drain())
            .await
            .expect("drain should return for an empty registry");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_every_guard() {
        let registry = SessionRegistry::new();
        let a = registry.add("a", "t").unwrap();
        let b = registry.add("b", "t").unwrap();

        let drain = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.drain().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drain.is_finished());

        // Removing from the map is not enough; the guard holds the drain token
        registry.remove("a");
        drop(b);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drain.is_finished());

        drop(a);
        drain.await.unwrap();
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_sessions_added_while_draining() {
        let registry = SessionRegistry::new();
        let first = registry.add("a", "t").unwrap();

        let drain = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let late = registry.add("b", "t").unwrap();
        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!drain.is_finished(), "drain returned with a session in flight");

        drop(late);
        drain.await.unwrap();
    }
}
