//! Session processing.
//!
//! The coordinator treats processing as an opaque collaborator: it asks a
//! [`StreamProcessor`] to dial a session's target before the session is
//! registered, then hands the open connection back to the processor on the
//! session's own task.

mod tcp;
pub mod mock;

pub use tcp::{TcpStreamProcessor, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TARGET_PORT};

use crate::errors::WorkerError;
use crate::lifecycle::Session;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to a session target.
pub trait TargetIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TargetIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An open connection to a session target.
pub struct TargetConnection {
    target: String,
    io: Box<dyn TargetIo>,
}

impl TargetConnection {
    pub fn new(target: impl Into<String>, io: impl TargetIo + 'static) -> Self {
        Self {
            target: target.into(),
            io: Box::new(io),
        }
    }

    /// Target as submitted with the session.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn into_io(self) -> Box<dyn TargetIo> {
        self.io
    }
}

impl fmt::Debug for TargetConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConnection")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Dials session targets and processes admitted sessions.
#[async_trait::async_trait]
pub trait StreamProcessor: Send + Sync {
    /// Open a connection to `target`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::TargetUnreachable` if the target cannot be reached.
    async fn connect(&self, target: &str) -> Result<TargetConnection, WorkerError>;

    /// Process one admitted session to completion, returning the number of
    /// bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Processing` if the stream fails mid-session.
    async fn process(
        &self,
        session: &Session,
        connection: TargetConnection,
    ) -> Result<u64, WorkerError>;
}
