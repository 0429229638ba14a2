//! HTTP request handlers for the stream worker.

pub mod sessions;
pub mod status;

pub use sessions::submit_session;
pub use status::get_status;
