use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    // ------------------------------------------------------------------
    // Boundary errors, mirrored by HTTP status codes
    // ------------------------------------------------------------------
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    // ------------------------------------------------------------------
    // Backend errors
    // ------------------------------------------------------------------
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse store file {path}: {source}")]
    StoreFileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("store file {path} has unsupported version {found}; expected {expected}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("failed to format current UTC timestamp as RFC3339: {0}")]
    ClockFormat(#[source] time::error::Format),
}

impl GatewayError {
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    #[must_use]
    pub fn thread_not_found(thread_id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "thread",
            id: thread_id.into(),
        }
    }

    #[must_use]
    pub fn message_not_found(message_id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "message",
            id: message_id.into(),
        }
    }

    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// HTTP status class of this failure: 401, 400, 404, or 500.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::InvalidRequest(_) => 400,
            Self::NotFound { .. } => 404,
            Self::UnexpectedStatus { status, .. } => *status,
            _ => 500,
        }
    }

    /// Unauthorized, invalid, and not-found failures are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Unauthorized(_) | Self::InvalidRequest(_) | Self::NotFound { .. }
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
