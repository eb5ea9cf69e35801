use std::io;

use thiserror::Error;

/// Failure to retrieve a document or an embedded resource.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot GET {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("{url}: missing or empty content type")]
    MissingContentType { url: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("fetch dispatcher is shut down")]
    DispatcherClosed,
}

impl FetchError {
    /// Rate limits and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Http { source, .. } => source.is_timeout() || source.is_connect(),
            _ => false,
        }
    }
}

/// Failure to turn an exported line into a raw document.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{id}: malformed metadata field '{field}'")]
    Metadata { id: String, field: &'static str },
}
