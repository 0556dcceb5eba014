use std::sync::Arc;

use thiserror::Error;

use crate::status::ErrorKind;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while synchronizing flag data.
///
/// Evaluation never returns these. A flag that cannot be evaluated resolves to a
/// [`Detail`](crate::Detail) with an error [`Reason`](crate::Reason) instead.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The remote service answered with a non-2xx status.
    #[error("received HTTP error {0}")]
    HttpStatus(u16),

    /// Transport-level failure from the HTTP client.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// An I/O error, e.g. a dropped streaming connection.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// A payload could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The data store failed to apply an update.
    #[error("data store error: {0}")]
    Store(String),

    /// Invalid base or stream URI configuration.
    #[error("invalid URI configuration")]
    InvalidUri(#[source] url::ParseError),

    /// A background data source thread panicked. This should normally never happen.
    #[error("data source thread panicked")]
    ThreadPanicked,
}

impl Error {
    /// Classify the error for status reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::HttpStatus(_) => ErrorKind::ErrorResponse,
            Error::Network(_) | Error::Io(_) => ErrorKind::NetworkError,
            Error::InvalidData(_) => ErrorKind::InvalidData,
            Error::Store(_) => ErrorKind::StoreError,
            Error::InvalidUri(_) | Error::ThreadPanicked => ErrorKind::Unknown,
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::HttpStatus(status) => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying after this error can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::HttpStatus(status) => is_http_error_recoverable(*status),
            Error::InvalidUri(_) => false,
            _ => true,
        }
    }
}

/// Returns `true` if a request that failed with `status` is worth retrying.
///
/// Client errors are permanent (bad credentials, unknown environment), except for 400, 408 and
/// 429. Everything else is assumed to be transient.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => Error::HttpStatus(status.as_u16()),
            None => Error::Network(Arc::new(value.without_url())),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidData(value.to_string())
    }
}
