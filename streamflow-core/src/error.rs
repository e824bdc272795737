use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Upstream request error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Upstream returned {status} for {context}")]
    UpstreamStatus {
        status: http::StatusCode,
        context: String,
    },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid regex pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error came from a transient upstream condition that is
    /// worth retrying (5xx, connect failures, timeouts).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Upstream(err) => {
                err.is_timeout() || err.is_connect() || err.is_request()
            }
            Self::UpstreamStatus { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
