//! # Stream Worker Test Utilities
//!
//! Shared test utilities for the stream worker.
//!
//! This crate provides:
//! - Server test harness (`TestWorkerServer` for E2E tests over real HTTP)
//! - Mock control plane (`MockControlPlane`, a wiremock server that records
//!   status reports, events and session completions)
//! - Fixtures (`session_body`, `unique_session_id`, `StreamSource`)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sw_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestWorkerServer::spawn().await?;
//!     let client = reqwest::Client::new();
//!
//!     let response = client
//!         .post(format!("{}/stream", server.url()))
//!         .json(&session_body("s-1", "10.0.0.5:1935"))
//!         .send()
//!         .await?;
//!
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod mock_control_plane;
pub mod server_harness;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_control_plane::*;
pub use server_harness::*;
