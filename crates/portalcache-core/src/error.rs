use std::time::Duration;

use thiserror::Error;

/// Errors raised by the worker core.
///
/// `Clone` so one network result can be handed to every request that was
/// coalesced onto it.
#[derive(Error, Debug, Clone)]
pub enum WorkerError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Network request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Corrupt store timestamp: {0:?}")]
    CorruptTimestamp(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unexpected status {status} for {url}: {body}")]
    BadStatus { status: u16, url: String, body: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not supported by host: {0}")]
    Unsupported(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 200;

impl WorkerError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, url: &str, body: &[u8]) -> Self {
        WorkerError::BadStatus {
            status,
            url: url.to_string(),
            body: Self::truncate_body(&String::from_utf8_lossy(body)),
        }
    }

    /// True for failures that mean "the network is unavailable", which is
    /// what sends a fetch down the offline fallback chain.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, WorkerError::Network(_) | WorkerError::Timeout(_))
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        WorkerError::Network(e.to_string())
    }
}

impl From<std::io::Error> for WorkerError {
    fn from(e: std::io::Error) -> Self {
        WorkerError::Cache(e.to_string())
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        WorkerError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for WorkerError {
    fn from(e: url::ParseError) -> Self {
        WorkerError::InvalidRequest(e.to_string())
    }
}
