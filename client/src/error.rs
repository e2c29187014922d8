//! Error type for the replay client library.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// A manager API request failed (transport or HTTP status).
    #[error("manager request failed: {0}")]
    Manager(#[from] reqwest::Error),

    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// The replay socket is closed, closing, or failed to open.
    #[error("replay socket closed")]
    SocketClosed,

    /// Establishing a backend connection failed.
    #[error("backend connection failed: {0}")]
    Connect(String),

    /// A backend/page operation failed.
    #[error("backend error: {0}")]
    Backend(String),

    #[error("page is closed")]
    PageClosed,
}
