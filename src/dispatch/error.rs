//! Status-carrying request failures.

use crate::protocol::StatusCode;
use std::error::Error as StdError;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// A request failure that maps to a specific HTTP status.
///
/// Modules return these (directly or wrapped in `anyhow` context) to have
/// the dispatcher render an error page with that status. A 401 instead
/// re-issues the authentication challenge.
///
/// # Example
/// ```
/// use portico::dispatch::HttpError;
/// use portico::protocol::StatusCode;
///
/// let err = HttpError::not_found("no such album");
/// assert_eq!(err.status(), StatusCode::NOT_FOUND);
/// assert_eq!(err.to_string(), "404 Not Found: no such album");
/// ```
#[derive(Debug, Error)]
#[error("{status}: {message}")]
pub struct HttpError {
    status: StatusCode,
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            source: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Attaches the underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Finds the first `HttpError` in an error's cause chain.
pub fn find_http_error(err: &anyhow::Error) -> Option<&HttpError> {
    err.chain().find_map(|e| e.downcast_ref::<HttpError>())
}
