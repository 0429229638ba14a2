//! In-memory stream processor for testing.
//!
//! Connections are `tokio::io::duplex` pipes, so nothing touches the network.
//! Each session blocks in `process` until the test releases it by id, which
//! lets tests hold sessions open across timer fires and shutdown requests.

use super::{StreamProcessor, TargetConnection};
use crate::errors::WorkerError;
use crate::lifecycle::Session;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GateState {
    unreachable: HashSet<String>,
    failing: HashSet<String>,
    gates: HashMap<String, Arc<Notify>>,
    in_progress: HashSet<String>,
    connects: usize,
}

/// Processor whose sessions run until released.
#[derive(Debug, Default)]
pub struct GatedProcessor {
    state: Mutex<GateState>,
    open: AtomicBool,
}

impl GatedProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, session_id: &str) -> Arc<Notify> {
        Arc::clone(
            self.state()
                .gates
                .entry(session_id.to_string())
                .or_default(),
        )
    }

    /// Make `connect` fail for `target`.
    pub fn set_unreachable(&self, target: &str) {
        self.state().unreachable.insert(target.to_string());
    }

    /// Make processing of `session_id` fail once released.
    pub fn set_failing(&self, session_id: &str) {
        self.state().failing.insert(session_id.to_string());
    }

    /// Let `session_id` finish. Releasing before processing starts is remembered.
    pub fn release(&self, session_id: &str) {
        self.gate(session_id).notify_one();
    }

    /// Let every current and future session finish immediately.
    pub fn release_all(&self) {
        self.open.store(true, Ordering::SeqCst);
        for gate in self.state().gates.values() {
            gate.notify_one();
        }
    }

    /// Ids of sessions currently blocked in `process`.
    pub fn in_progress(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().in_progress.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> usize {
        self.state().connects
    }
}

#[async_trait::async_trait]
impl StreamProcessor for GatedProcessor {
    async fn connect(&self, target: &str) -> Result<TargetConnection, WorkerError> {
        let mut state = self.state();
        if state.unreachable.contains(target) {
            return Err(WorkerError::TargetUnreachable(target.to_string()));
        }
        state.connects += 1;

        let (local, _remote) = tokio::io::duplex(64);
        Ok(TargetConnection::new(target, local))
    }

    async fn process(
        &self,
        session: &Session,
        _connection: TargetConnection,
    ) -> Result<u64, WorkerError> {
        let gate = self.gate(&session.id);
        self.state().in_progress.insert(session.id.clone());

        if !self.open.load(Ordering::SeqCst) {
            gate.notified().await;
        }

        let mut state = self.state();
        state.in_progress.remove(&session.id);
        if state.failing.contains(&session.id) {
            return Err(WorkerError::Processing(format!(
                "session {} failed",
                session.id
            )));
        }
        Ok(0)
    }
}
