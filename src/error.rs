//! Error types for the tile proxy engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Error types that can occur while serving a request
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Upstream returned 4xx error: {status} - {message}")]
    OriginClientError { status: u16, message: String },

    #[error("Upstream returned 5xx error: {status} - {message}")]
    OriginServerError { status: u16, message: String },

    #[error("Unsatisfiable range: start {start} is beyond total size {total}")]
    UnsatisfiableRange { start: u64, total: u64 },

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Tile store error: {0}")]
    TileStoreError(String),

    #[error("No usable upstream candidate for object {0}")]
    NoUsableCandidate(String),

    #[error("Offline and nothing cached for {0}")]
    Offline(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            ProxyError::from_http_status(status.as_u16(), err.to_string())
        } else {
            ProxyError::NetworkError(err.to_string())
        }
    }
}

impl ProxyError {
    /// Determine if this error should trigger a retry of an upstream fetch
    ///
    /// Transient conditions (5xx, timeouts, dropped connections, IO) are retried.
    /// Client errors and anything produced by local validation are not.
    pub fn should_retry(&self) -> bool {
        match self {
            ProxyError::OriginServerError { .. } => true,
            ProxyError::Timeout(_) => true,
            ProxyError::NetworkError(_) => true,
            ProxyError::IoError(_) => true,
            ProxyError::HttpError(_) => true,

            ProxyError::OriginClientError { .. } => false,
            ProxyError::InvalidResponse(_) => false,
            ProxyError::ConfigError(_) => false,
            ProxyError::UnsatisfiableRange { .. } => false,
            ProxyError::ParseError(_) => false,
            ProxyError::CacheError(_) => false,
            ProxyError::TileStoreError(_) => false,
            ProxyError::NoUsableCandidate(_) => false,
            ProxyError::Offline(_) => false,
            ProxyError::InternalError(_) => false,
        }
    }

    /// Convert error to the HTTP status code returned to the client
    pub fn to_http_status(&self) -> u16 {
        match self {
            ProxyError::OriginClientError { status, .. } => *status,
            ProxyError::OriginServerError { .. } => 502,

            ProxyError::UnsatisfiableRange { .. } => 416,
            ProxyError::ParseError(_) => 400,

            ProxyError::NetworkError(_) => 502,
            ProxyError::HttpError(_) => 502,
            ProxyError::InvalidResponse(_) => 502,
            ProxyError::NoUsableCandidate(_) => 502,
            ProxyError::Timeout(_) => 504,
            ProxyError::Offline(_) => 503,

            ProxyError::ConfigError(_) => 500,
            ProxyError::CacheError(_) => 500,
            ProxyError::TileStoreError(_) => 500,
            ProxyError::IoError(_) => 500,
            ProxyError::InternalError(_) => 500,
        }
    }

    /// Create an OriginClientError from a status code and message
    pub fn origin_client_error(status: u16, message: impl Into<String>) -> Self {
        ProxyError::OriginClientError {
            status,
            message: message.into(),
        }
    }

    /// Create an OriginServerError from a status code and message
    pub fn origin_server_error(status: u16, message: impl Into<String>) -> Self {
        ProxyError::OriginServerError {
            status,
            message: message.into(),
        }
    }

    /// Create an error from an HTTP status code
    ///
    /// Automatically categorizes as 4xx or 5xx error
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (400..500).contains(&status) {
            ProxyError::origin_client_error(status, message)
        } else if (500..600).contains(&status) {
            ProxyError::origin_server_error(status, message)
        } else {
            ProxyError::HttpError(format!("HTTP {}: {}", status, message))
        }
    }
}
