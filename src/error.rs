//! Error types for proxyauth

use std::io;

use thiserror::Error;

/// Result type alias for proxyauth
pub type Result<T> = std::result::Result<T, Error>;

/// proxyauth errors
///
/// Validation failures on the backend are *not* errors: they travel as
/// [`crate::backend::Response::Error`] values. The variants below are the
/// environment, method and configuration failures that abort an operation.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (bad config file, bad method config)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage read or write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Request could not be processed by the backend (malformed headers,
    /// missing connection info, policy drift on renewal)
    #[error("{0}")]
    Fatal(String),

    /// Retryable failure inside an auth method
    #[error("Auth method error: {0}")]
    Method(String),

    /// The host answered with a non-success status
    #[error("Host error: {0}")]
    Api(String),

    /// File watcher error
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Shutdown was requested while the operation was in flight
    #[error("Shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` when the agent should retry the operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Method(_) | Self::Api(_) | Self::Http(_) | Self::Io(_) | Self::Json(_)
        )
    }
}

impl From<notify::Error> for Error {
    fn from(e: notify::Error) -> Self {
        Self::Watcher(e.to_string())
    }
}
