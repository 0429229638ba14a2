//! Mock control plane for E2E testing
//!
//! Wraps a wiremock `MockServer` that answers the three control plane
//! endpoints and exposes the requests it received in decoded form.

use serde::Deserialize;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// A status report received on `/update-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: String,
    pub reason: Option<String>,
}

/// An event received on `/notify`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventReport {
    pub reason: String,
    pub message: String,
}

/// Wiremock-backed control plane.
///
/// # Example
/// ```rust,ignore
/// let control_plane = MockControlPlane::accepting().await;
/// let client = HttpControlPlaneClient::new(&control_plane.url(), Duration::from_secs(1))?;
///
/// client.report_status(InstanceStatus::Running, &StatusExtra::new()).await?;
///
/// assert_eq!(control_plane.status_reports().await[0].status, "Running");
/// ```
pub struct MockControlPlane {
    server: MockServer,
}

impl MockControlPlane {
    /// Start a control plane that accepts every call with `200 OK`.
    pub async fn accepting() -> Self {
        Self::responding_with(200).await
    }

    /// Start a control plane that answers every call with `status`.
    pub async fn responding_with(status: u16) -> Self {
        let server = MockServer::start().await;

        for endpoint in ["/update-status", "/notify", "/complete"] {
            Mock::given(method("POST"))
                .and(path(endpoint))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        Self { server }
    }

    /// Base URL to configure the worker with.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// The underlying server, for mounting custom expectations.
    pub fn server(&self) -> &MockServer {
        &self.server
    }

    async fn requests_to(&self, endpoint: &str) -> Vec<Request> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == endpoint)
            .collect()
    }

    /// Status reports in the order they were received.
    pub async fn status_reports(&self) -> Vec<StatusReport> {
        self.requests_to("/update-status")
            .await
            .into_iter()
            .map(|request| {
                let query_value = |key: &str| {
                    request
                        .url
                        .query_pairs()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.into_owned())
                };
                StatusReport {
                    status: query_value("status").unwrap_or_default(),
                    reason: query_value("reason"),
                }
            })
            .collect()
    }

    /// Events in the order they were received.
    pub async fn events(&self) -> Vec<EventReport> {
        self.requests_to("/notify")
            .await
            .into_iter()
            .map(|request| {
                request
                    .body_json::<EventReport>()
                    .expect("notify body should be a JSON event")
            })
            .collect()
    }

    /// Ids of completed sessions in the order they were reported.
    pub async fn completed_sessions(&self) -> Vec<String> {
        self.requests_to("/complete")
            .await
            .into_iter()
            .filter_map(|request| {
                request
                    .url
                    .query_pairs()
                    .find(|(k, _)| k == "id")
                    .map(|(_, v)| v.into_owned())
            })
            .collect()
    }
}
