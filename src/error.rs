use reqwest::StatusCode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single request against the remote resource (probe or segment).
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("no data received for {0:?}")]
    Timeout(Duration),

    #[error("request rejected with status {0}")]
    Client(StatusCode),

    #[error("server error with status {0}")]
    Server(StatusCode),

    #[error("unexpected response status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("server ignored range request at offset {0}")]
    RangeIgnored(u64),

    #[error("received {received} bytes, expected {expected}")]
    Integrity { expected: u64, received: u64 },

    #[error("filesystem error: {0}")]
    Filesystem(#[from] io::Error),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Maps a non-success HTTP status onto the matching error class.
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_client_error() {
            FetchError::Client(status)
        } else if status.is_server_error() {
            FetchError::Server(status)
        } else {
            FetchError::UnexpectedStatus(status)
        }
    }

    /// Errors worth another attempt inside the Fetcher's backoff loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_)
                | FetchError::Timeout(_)
                | FetchError::Server(_)
                | FetchError::Integrity { .. }
        )
    }

    /// Errors that abort the whole download without reassignment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::Filesystem(_))
    }

    /// Whether the orchestrator may hand a segment that died with this error to a fresh worker.
    pub fn is_reassignable(&self) -> bool {
        self.is_retryable()
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to probe {url}: {source}")]
    Probe {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("segment {index} failed: {source}")]
    Segment {
        index: usize,
        #[source]
        source: FetchError,
    },

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("download worker crashed: {0}")]
    Worker(String),

    #[error("failed to write progress: {0}")]
    Output(#[source] io::Error),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    pub fn filesystem(context: impl Into<String>, source: io::Error) -> Self {
        DownloadError::Filesystem {
            context: context.into(),
            source,
        }
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retried_client_errors_are_not() {
        assert!(FetchError::from_status(StatusCode::SERVICE_UNAVAILABLE).is_retryable());
        assert!(FetchError::from_status(StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!FetchError::from_status(StatusCode::NOT_FOUND).is_retryable());
        assert!(!FetchError::from_status(StatusCode::FORBIDDEN).is_retryable());
        assert!(matches!(
            FetchError::from_status(StatusCode::NOT_MODIFIED),
            FetchError::UnexpectedStatus(_)
        ));
    }

    #[test]
    fn filesystem_errors_are_fatal() {
        let err = FetchError::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(err.is_fatal());
        assert!(!err.is_retryable());
        assert!(!err.is_reassignable());
    }

    #[test]
    fn integrity_and_timeouts_are_reassignable() {
        let short = FetchError::Integrity {
            expected: 10,
            received: 4,
        };
        assert!(short.is_retryable());
        assert!(short.is_reassignable());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_reassignable());
        assert!(!FetchError::RangeIgnored(100).is_reassignable());
        assert!(!FetchError::Cancelled.is_retryable());
    }
}
