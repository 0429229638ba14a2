//! Stream Worker
//!
//! Disposable worker instance that processes stream sessions until its
//! lifetime expires or it sits idle, then drains and exits.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Bind the HTTP listener (fail fast on bind errors)
//! 4. Report `Starting` and start the lifetime and inactivity timers
//! 5. Serve HTTP (sessions, status, health, metrics)
//! 6. Report `Running` and mark ready
//! 7. Wait for the first shutdown reason (timer or SIGINT/SIGTERM)
//! 8. Report `ShutdownRequested`, drain sessions, report `ShuttingDown`
//! 9. Stop the HTTP server within the grace period, then exit

#![warn(clippy::pedantic)]

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use stream_worker::config::Config;
use stream_worker::control_plane::{ControlPlaneNotifier, HttpControlPlaneClient};
use stream_worker::errors::WorkerError;
use stream_worker::lifecycle::{ShutdownCoordinator, ShutdownReason, ShutdownTrigger};
use stream_worker::observability::HealthState;
use stream_worker::routes::{build_routes, AppState};
use stream_worker::stream::{StreamProcessor, TcpStreamProcessor};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_worker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stream Worker");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        bind_address = %config.bind_address,
        control_plane_url = %config.control_plane_url,
        lifetime_seconds = config.lifetime_seconds,
        inactivity_timeout_seconds = config.inactivity_timeout_seconds,
        shutdown_grace_seconds = config.shutdown_grace_seconds,
        max_session_seconds = config.max_session_seconds,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    let health_state = Arc::new(HealthState::new());

    let notifier: Arc<dyn ControlPlaneNotifier> = Arc::new(
        HttpControlPlaneClient::new(&config.control_plane_url, config.notify_timeout()).map_err(
            |e| {
                error!(error = %e, "Failed to create control plane client");
                e
            },
        )?,
    );
    let processor: Arc<dyn StreamProcessor> =
        Arc::new(TcpStreamProcessor::new(config.connect_timeout()));

    let (coordinator, mut timers) = ShutdownCoordinator::new(
        config.instance_id.clone(),
        config.lifecycle_settings(),
        notifier,
        processor,
        Arc::clone(&health_state),
    );

    // Bind listener BEFORE reporting Starting to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind HTTP listener");
            format!("Failed to bind HTTP listener to {}: {e}", config.bind_address)
        })?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "HTTP listener bound successfully");

    coordinator.begin_startup().await?;
    timers.start();

    let app = build_routes(Arc::new(AppState {
        coordinator: Arc::clone(&coordinator),
        health: Arc::clone(&health_state),
        metrics: prometheus_handle,
    }));

    let server_token = CancellationToken::new();
    let server_shutdown = server_token.clone();
    let server = tokio::spawn(async move {
        info!(addr = %local_addr, "HTTP server starting");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                server_shutdown.cancelled().await;
                info!("HTTP server shutting down");
            })
            .await
    });

    coordinator.confirm_startup().await?;

    tokio::spawn(forward_shutdown_signal(coordinator.trigger()));

    info!("Stream Worker running - press Ctrl+C to shutdown");

    let final_status = coordinator
        .run(timers, async move {
            server_token.cancel();
            match server.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(WorkerError::Transport(e.to_string())),
                Err(e) => Err(WorkerError::Transport(format!("server task failed: {e}"))),
            }
        })
        .await;

    // ShutdownFailed is reported, not retried; the instance exits either way
    info!(status = %final_status, "Stream Worker shutdown complete");
    Ok(())
}

/// Deliver SIGINT/SIGTERM as a shutdown reason.
async fn forward_shutdown_signal(trigger: ShutdownTrigger) {
    shutdown_signal().await;
    info!("Shutdown signal received, requesting shutdown");
    trigger.fire(ShutdownReason::Signal);
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// A handler that cannot be installed never resolves; the timers still
/// bound the instance lifetime.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
