//! Translation of internal outcomes into HTTP responses
//!
//! The only place that knows about status codes.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use super::protocol::ErrorBody;
use super::range::RangeError;
use crate::b2::OriginError;
use crate::cache::{FetchError, KeyError};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidFilename(#[from] KeyError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{source}")]
    Range {
        source: RangeError,
        /// Size of the file the range was checked against
        size: u64,
    },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error("Failed to read cached file: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidFilename(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Fetch(FetchError::OriginNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Fetch(_) | ApiError::Origin(_) => StatusCode::BAD_GATEWAY,
            ApiError::Range { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "Request failed");
        }

        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        match self {
            ApiError::Range { size, .. } => (
                status,
                [
                    (header::CONTENT_RANGE, format!("bytes */{}", size)),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}
