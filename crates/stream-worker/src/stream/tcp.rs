//! TCP stream processor.
//!
//! Targets are either a plain `host:port` or a URL such as
//! `rtmp://media.example.com/live/key`; a URL without a port dials the
//! scheme's known default, falling back to [`DEFAULT_TARGET_PORT`].

use super::{StreamProcessor, TargetConnection};
use crate::errors::WorkerError;
use crate::lifecycle::Session;
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Default bound on dialing a session target.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Port dialed for URL targets that carry neither a port nor a known scheme.
pub const DEFAULT_TARGET_PORT: u16 = 1935;

/// Resolve a session target to a dialable `host:port`.
fn dial_address(target: &str) -> Result<String, WorkerError> {
    if !target.contains("://") {
        return Ok(target.to_string());
    }

    let url = Url::parse(target)
        .map_err(|e| WorkerError::TargetUnreachable(format!("{target}: {e}")))?;
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| WorkerError::TargetUnreachable(format!("{target}: missing host")))?;
    let port = url.port_or_known_default().unwrap_or(DEFAULT_TARGET_PORT);

    // IPv6 hosts keep their brackets in host_str
    Ok(format!("{host}:{port}"))
}

/// Dials targets over TCP and consumes the upstream until it closes.
#[derive(Debug, Clone)]
pub struct TcpStreamProcessor {
    connect_timeout: Duration,
}

impl Default for TcpStreamProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TcpStreamProcessor {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait::async_trait]
impl StreamProcessor for TcpStreamProcessor {
    #[instrument(skip_all)]
    async fn connect(&self, target: &str) -> Result<TargetConnection, WorkerError> {
        let address = dial_address(target)?;

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                WorkerError::TargetUnreachable(format!(
                    "{address}: connect timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| WorkerError::TargetUnreachable(format!("{address}: {e}")))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(target: "sw.stream", error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(target: "sw.stream", address = %address, "Connected to session target");
        Ok(TargetConnection::new(target, stream))
    }

    #[instrument(skip_all, fields(session_id = %session.id))]
    async fn process(
        &self,
        session: &Session,
        connection: TargetConnection,
    ) -> Result<u64, WorkerError> {
        let mut upstream = connection.into_io();
        let mut sink = tokio::io::sink();

        let bytes = tokio::io::copy(&mut upstream, &mut sink)
            .await
            .map_err(|e| WorkerError::Processing(format!("read from upstream failed: {e}")))?;

        debug!(target: "sw.stream", bytes, "Upstream closed");
        Ok(bytes)
    }
}
