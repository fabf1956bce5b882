//! Error types for modproxy-proxy

use http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection refused, reset, timed out or body read failure
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to decompress gzip body: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("Failed to write cache file {path:?}: {source}")]
    CacheWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} response missing Location header")]
    MissingLocation(u16),

    #[error("Failed to parse Location header {location:?}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error("Failed to fetch redirect target {url}: {reason}")]
    RedirectFetch { url: String, reason: String },

    #[error("All upstreams failed after {attempts} attempts")]
    UpstreamsExhausted { attempts: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Status code reported to the client for this error
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::ConfigError(_) | ProxyError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the retry/failover state machine should handle this error
    pub fn is_transport(&self) -> bool {
        matches!(self, ProxyError::Transport(_))
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
