//! B2 API Error Types
//!
//! Structured error handling for Backblaze B2 API operations.
//! Maps HTTP status codes to specific error variants for retry decisions.

/// Remote object store error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum OriginError {
    #[error("Authentication expired, token needs refresh")]
    AuthExpired,

    #[error("Rate limited, try again after backoff")]
    RateLimited,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({0}): {1}")]
    Server(u16, String),

    #[error("Request timeout")]
    Timeout,

    #[error("Request error: {0}")]
    Request(String),
}

impl OriginError {
    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OriginError::RateLimited
                | OriginError::Timeout
                | OriginError::Network(_)
                | OriginError::Server(_, _)
                | OriginError::AuthExpired
        )
    }

    /// Create an OriginError from an HTTP status code and response body
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => OriginError::AuthExpired,
            403 => OriginError::Forbidden(body.to_string()),
            404 => OriginError::NotFound(body.to_string()),
            408 => OriginError::Timeout,
            429 => OriginError::RateLimited,
            500..=599 => OriginError::Server(status, body.to_string()),
            _ => OriginError::Request(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for OriginError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OriginError::Timeout
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            OriginError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            OriginError::from_status(status.as_u16(), &err.to_string())
        } else {
            OriginError::Network(err.to_string())
        }
    }
}
