//! Test server harness for E2E testing
//!
//! Provides `TestWorkerServer` for spawning a real stream worker HTTP server
//! in tests. The coordinator is wired to in-crate test doubles: a
//! `RecordingNotifier` in place of the control plane and a `GatedProcessor`
//! whose sessions run until released.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use stream_worker::control_plane::mock::RecordingNotifier;
use stream_worker::control_plane::ControlPlaneNotifier;
use stream_worker::lifecycle::{LifecycleSettings, ShutdownCoordinator, ShutdownTimers};
use stream_worker::observability::HealthState;
use stream_worker::routes::{self, AppState};
use stream_worker::stream::mock::GatedProcessor;
use stream_worker::stream::StreamProcessor;
use tokio::task::JoinHandle;

/// Test harness for spawning the stream worker server in E2E tests.
///
/// The instance is already `Running` when `spawn` returns. Its shutdown
/// timers are created but not started; take them with
/// [`take_timers`](Self::take_timers) to drive a full lifecycle.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_status_e2e() -> Result<(), anyhow::Error> {
///     let server = TestWorkerServer::spawn().await?;
///
///     let response = reqwest::get(format!("{}/status", server.url())).await?;
///
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestWorkerServer {
    addr: SocketAddr,
    coordinator: Arc<ShutdownCoordinator>,
    notifier: Arc<RecordingNotifier>,
    processor: Arc<GatedProcessor>,
    health: Arc<HealthState>,
    timers: Option<ShutdownTimers>,
    _handle: JoinHandle<()>,
}

impl TestWorkerServer {
    /// Spawn a server with default lifecycle settings.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with_settings(LifecycleSettings::default()).await
    }

    /// Spawn a server with custom lifecycle settings.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Move the instance through `Starting` to `Running`
    /// - Start the HTTP server in the background
    pub async fn spawn_with_settings(settings: LifecycleSettings) -> Result<Self, anyhow::Error> {
        let notifier = Arc::new(RecordingNotifier::new());
        let processor = Arc::new(GatedProcessor::new());
        let health = Arc::new(HealthState::new());

        let (coordinator, timers) = ShutdownCoordinator::new(
            "sw-test-instance",
            settings,
            Arc::clone(&notifier) as Arc<dyn ControlPlaneNotifier>,
            Arc::clone(&processor) as Arc<dyn StreamProcessor>,
            Arc::clone(&health),
        );

        // Not installed globally; each test server renders its own registry
        let metrics = PrometheusBuilder::new().build_recorder().handle();

        let state = Arc::new(AppState {
            coordinator: Arc::clone(&coordinator),
            health: Arc::clone(&health),
            metrics,
        });

        // Build routes using the worker's real route builder
        let app = routes::build_routes(state);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        coordinator
            .begin_startup()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to begin startup: {}", e))?;

        // Spawn server in background
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        coordinator
            .confirm_startup()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to confirm startup: {}", e))?;

        Ok(Self {
            addr,
            coordinator,
            notifier,
            processor,
            health,
            timers: Some(timers),
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }

    /// Control plane calls made by the instance so far.
    pub fn notifier(&self) -> &Arc<RecordingNotifier> {
        &self.notifier
    }

    /// Processor backing every session; release sessions through it.
    pub fn processor(&self) -> &Arc<GatedProcessor> {
        &self.processor
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    /// Take the (unstarted) shutdown timers. Returns `None` after the first call.
    pub fn take_timers(&mut self) -> Option<ShutdownTimers> {
        self.timers.take()
    }
}

impl Drop for TestWorkerServer {
    fn drop(&mut self) {
        // Explicitly abort the HTTP server task to ensure immediate cleanup
        // when the test completes.
        self._handle.abort();
        // Sessions still blocked in the processor would otherwise outlive the test
        self.processor.release_all();
    }
}
