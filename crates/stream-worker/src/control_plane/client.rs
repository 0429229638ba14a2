//! HTTP control plane client.
//!
//! All calls are `POST`s against the control plane base URL:
//! - `/update-status?status=<s>[&reason=<r>]`
//! - `/notify` with JSON body `{"reason": ..., "message": ...}`
//! - `/complete?id=<id>`
//!
//! `reqwest::Client` is cheaply cloneable and pools connections internally,
//! so one client is shared by every caller without locking.

use super::{ControlPlaneNotifier, StatusExtra};
use crate::errors::WorkerError;
use crate::lifecycle::InstanceStatus;
use reqwest::Url;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default per-request timeout for control plane calls.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const UPDATE_STATUS_PATH: &str = "update-status";
const NOTIFY_PATH: &str = "notify";
const COMPLETE_PATH: &str = "complete";

#[derive(Serialize)]
struct NotifyPayload<'a> {
    reason: &'a str,
    message: &'a str,
}

/// Control plane client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    base_url: Url,
    http_client: reqwest::Client,
}

impl HttpControlPlaneClient {
    /// Create a client for the control plane at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::Config` if the URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, WorkerError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| WorkerError::Config(format!("Invalid control plane URL: {e}")))?;

        // Url::join treats the last segment as a file unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .build()
            .map_err(|e| WorkerError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, WorkerError> {
        self.base_url
            .join(path)
            .map_err(|e| WorkerError::Config(format!("Invalid control plane endpoint: {e}")))
    }

    async fn send(&self, request: reqwest::RequestBuilder, endpoint: &str) -> Result<(), WorkerError> {
        let response = request.send().await.map_err(|e| {
            warn!(
                target: "sw.control_plane",
                endpoint = %endpoint,
                error = %e,
                "Control plane request failed"
            );
            WorkerError::NotificationFailure(format!("{endpoint}: {e}"))
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(target: "sw.control_plane", endpoint = %endpoint, "Control plane request accepted");
            Ok(())
        } else {
            warn!(
                target: "sw.control_plane",
                endpoint = %endpoint,
                status = %status,
                "Control plane returned non-success status"
            );
            Err(WorkerError::NotificationFailure(format!(
                "{endpoint}: unexpected status {status}"
            )))
        }
    }
}

#[async_trait::async_trait]
impl ControlPlaneNotifier for HttpControlPlaneClient {
    #[instrument(skip_all, fields(status = %status))]
    async fn report_status(
        &self,
        status: InstanceStatus,
        extra: &StatusExtra,
    ) -> Result<(), WorkerError> {
        let mut url = self.endpoint(UPDATE_STATUS_PATH)?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in extra {
                query.append_pair(key, value);
            }
            query.append_pair("status", status.as_str());
        }

        self.send(self.http_client.post(url), UPDATE_STATUS_PATH).await
    }

    #[instrument(skip_all, fields(reason = %reason))]
    async fn report_event(&self, reason: &str, message: &str) -> Result<(), WorkerError> {
        let url = self.endpoint(NOTIFY_PATH)?;
        let request = self
            .http_client
            .post(url)
            .json(&NotifyPayload { reason, message });

        self.send(request, NOTIFY_PATH).await
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn report_session_complete(&self, session_id: &str) -> Result<(), WorkerError> {
        let mut url = self.endpoint(COMPLETE_PATH)?;
        url.query_pairs_mut().append_pair("id", session_id);

        self.send(self.http_client.post(url), COMPLETE_PATH).await
    }
}
