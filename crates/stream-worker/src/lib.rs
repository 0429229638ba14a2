//! Stream Worker Library
//!
//! A disposable worker instance that admits short-lived stream sessions and
//! terminates itself after a fixed lifetime or a period of inactivity,
//! coordinating its shutdown with an external control plane:
//!
//! - Session intake over HTTP (`POST /stream`), one task per session
//! - Instance status reported to the control plane on every transition
//! - Lifetime and inactivity timers racing to trigger shutdown
//! - Drain of in-flight sessions before the transport is stopped
//!
//! # Lifecycle
//!
//! ```text
//! Inactive → Starting → Running → ShutdownRequested → ShuttingDown ─┬→ exit
//!                                                                   └→ ShutdownFailed → exit
//! ```
//!
//! # Modules
//!
//! - [`lifecycle`] - Status state machine, session registry, timers, coordinator
//! - [`control_plane`] - Outbound notifications to the control plane
//! - [`stream`] - Dialing targets and processing sessions
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with HTTP status mapping

pub mod config;
pub mod control_plane;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod observability;
pub mod routes;
pub mod stream;
