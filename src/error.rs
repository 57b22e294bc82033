//! Error types for the realtime relay

use std::io;

use thiserror::Error;

use crate::registry::ConnectionId;

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

/// Relay errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (missing credential, bad address, bad URL)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to open the upstream provider connection
    #[error("Upstream dial failed: {0}")]
    UpstreamDial(String),

    /// Provider answered with a non-success status
    #[error("Provider rejected request ({status}): {body}")]
    UpstreamRejected {
        /// HTTP status code returned by the provider
        status: u16,
        /// Provider error body, passed through verbatim
        body: String,
    },

    /// WebSocket transport error on either side of a session
    #[error("Transport error: {0}")]
    Transport(String),

    /// A session pair already exists for this connection id
    #[error("Session already registered: {0}")]
    DuplicateSession(ConnectionId),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the client could reasonably retry against a fresh
    /// connection (transient network conditions rather than configuration).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamDial(_) | Self::Transport(_) | Self::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display_includes_status_and_body() {
        let err = Error::UpstreamRejected {
            status: 401,
            body: r#"{"error":"invalid_api_key"}"#.to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("401"));
        assert!(msg.contains("invalid_api_key"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::UpstreamDial("timed out".into()).is_retryable());
        assert!(!Error::Config("no api key".into()).is_retryable());
        assert!(
            !Error::UpstreamRejected {
                status: 403,
                body: String::new()
            }
            .is_retryable()
        );
    }
}
