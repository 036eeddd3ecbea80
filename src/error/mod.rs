use reqwest::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

// ── Fetch ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("HTTP {status} from {url}")]
    Http { url: String, status: StatusCode },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("page {0} is not in the discovered catalog")]
    UnknownPage(u32),
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else if let Some(status) = err.status() {
            FetchError::Http { url: url.to_string(), status }
        } else {
            FetchError::Network {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Worth another attempt: timeouts, connection failures, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Network { .. } => true,
            FetchError::Http { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            FetchError::UnknownPage(_) => false,
        }
    }
}

// ── Parse ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("expected page structure `{0}` not found")]
    MissingStructure(&'static str),

    #[error("invalid selector `{0}`")]
    InvalidSelector(&'static str),

    #[error("invalid pattern `{0}`")]
    InvalidPattern(&'static str),
}

// ── Write ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed writing {path:?}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WriteError {
    pub fn io(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        WriteError::IoFailure {
            path: path.into(),
            source: source.into(),
        }
    }
}
