//! Error types for tierstore

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Request Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader elected")]
    NoLeader,

    #[error("Apply timed out after {0:?}")]
    ApplyTimeout(std::time::Duration),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Log corrupted: {0}")]
    LogCorrupted(String),

    // === Catalog Errors ===
    #[error("State conflict: {0}")]
    StateConflict(String),

    // === Data-plane Errors ===
    #[error("Insufficient shards: need {needed}, have {available}")]
    InsufficientShards { needed: usize, available: usize },

    #[error("Integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("Insufficient storage nodes: need {needed}, have {available}")]
    InsufficientNodes { needed: usize, available: usize },

    // === Network / External Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Key provider error: {0}")]
    KeyProvider(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_)
                | Error::NoLeader
                | Error::ApplyTimeout(_)
                | Error::UpstreamUnavailable(_)
                | Error::Http(_)
        )
    }

    /// Convert to an HTTP status code for API responses
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::InvalidRequest(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
            Error::ApplyTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::StateConflict(_) => StatusCode::CONFLICT,
            Error::InsufficientShards { .. } | Error::InsufficientNodes { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// CLI exit code mapping: 0 success, 1 local error, 2 server error, 3 auth failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::InvalidConfig(_) | Error::InvalidRequest(_) => 1,
            Error::Http(msg) if msg.contains("401") || msg.contains("403") => 3,
            _ => 2,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Error::UpstreamUnavailable(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(format!("JSON error: {}", e))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::NotLeader("n2".into()).to_http_status(),
            StatusCode::TEMPORARY_REDIRECT
        );
        assert_eq!(
            Error::NoLeader.to_http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::ApplyTimeout(std::time::Duration::from_secs(10)).to_http_status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            Error::StateConflict("bucket exists".into()).to_http_status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::NotFound("b1/x".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::NotLeader("n2".into()).is_retryable());
        assert!(Error::UpstreamUnavailable("down".into()).is_retryable());
        assert!(!Error::StateConflict("exists".into()).is_retryable());
        assert!(!Error::IntegrityFailure("tag".into()).is_retryable());
    }
}
