//! Request fixtures and a fake stream source.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// JSON body for `POST /stream`.
pub fn session_body(id: &str, target: &str) -> serde_json::Value {
    serde_json::json!({ "id": id, "target": target })
}

/// A session id that will not collide with any other test's.
pub fn unique_session_id() -> String {
    format!("session-{}", uuid::Uuid::new_v4())
}

/// A TCP upstream for real sessions.
///
/// Accepts every connection and keeps it open until
/// [`close_all`](Self::close_all), which ends each session with EOF.
pub struct StreamSource {
    addr: SocketAddr,
    connections: Arc<Mutex<Vec<TcpStream>>>,
    _handle: JoinHandle<()>,
}

impl StreamSource {
    /// Bind to a random port on 127.0.0.1 and start accepting.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind stream source: {}", e))?;
        let addr = listener.local_addr()?;

        let connections = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&connections);
        let handle = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                // Something for the worker to consume before EOF
                let _ = socket.write_all(b"FLV\x01").await;
                accepted.lock().unwrap().push(socket);
            }
        });

        Ok(Self {
            addr,
            connections,
            _handle: handle,
        })
    }

    /// `host:port` target to submit with a session.
    pub fn target(&self) -> String {
        self.addr.to_string()
    }

    /// Number of connections currently held open.
    pub fn open_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Close every held connection.
    pub fn close_all(&self) {
        self.connections.lock().unwrap().clear();
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

/// An address with nothing listening on it.
pub async fn unreachable_target() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
