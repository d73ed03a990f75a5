//! Error types for the inference transport.

use thiserror::Error;

/// Errors raised while sending a turn or reading its response stream.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP request failed or the connection dropped mid-body.
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// HTTP client configuration error.
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// The service answered with a non-success status.
    #[error("inference service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },

    /// Endpoint URL could not be built.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Transport closed by the caller.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Check if resending the same turn could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpRequest(err) => err.is_timeout() || err.is_connect(),
            Self::Status { status, .. } => *status >= 500,
            Self::HttpClient(_) | Self::InvalidUrl(_) | Self::Closed => false,
        }
    }
}

/// Convenience result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
