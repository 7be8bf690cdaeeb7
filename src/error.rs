use thread_store::GatewayError;
use thiserror::Error;

use crate::model_selection::CatalogError;

#[derive(Debug, Error)]
pub enum SessionError {
    // ------------------------------------------------------------------
    // Caller errors, never retried
    // ------------------------------------------------------------------
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // ------------------------------------------------------------------
    // Recoverable failures
    // ------------------------------------------------------------------
    #[error("persistence failed: {0}")]
    PersistenceFailure(#[source] GatewayError),

    #[error("model catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

impl SessionError {
    #[must_use]
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::InvalidRequest(_) => 400,
            Self::ThreadNotFound(_) => 404,
            Self::InvalidOperation(_) => 409,
            Self::PersistenceFailure(source) => source.status_code(),
            Self::Catalog(_) => 500,
        }
    }

    /// Only persistence failures are worth retrying.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::PersistenceFailure(source) if source.is_retryable())
    }
}

impl From<GatewayError> for SessionError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::Unauthorized(message) => Self::Unauthorized(message),
            GatewayError::InvalidRequest(message) => Self::InvalidRequest(message),
            GatewayError::NotFound {
                entity: "thread",
                id,
            } => Self::ThreadNotFound(id),
            GatewayError::NotFound { entity, id } => {
                Self::InvalidOperation(format!("{entity} not found: {id}"))
            }
            other => Self::PersistenceFailure(other),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
