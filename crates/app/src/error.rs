use axum::http::StatusCode;
use sandbox::UnsupportedLanguage;
use thiserror::Error;

use crate::pool::PoolError;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] UnsupportedLanguage),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {session_id} runs {expected}, not {requested}")]
    SessionLanguageMismatch {
        session_id: String,
        expected: String,
        requested: String,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl BrokerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedLanguage(_)
            | Self::InvalidRequest(_)
            | Self::SessionLanguageMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Pool(PoolError::CapacityExhausted { .. } | PoolError::Draining) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Pool(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::UnsupportedLanguage(_) => "unsupported_language",
            Self::InvalidRequest(_) => "invalid_request_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionLanguageMismatch { .. } => "session_language_mismatch",
            Self::Pool(PoolError::CapacityExhausted { .. }) => "capacity_exhausted",
            Self::Pool(PoolError::Draining) => "unavailable",
            Self::Pool(PoolError::Provision(_)) => "provision_error",
            Self::Pool(_) => "server_error",
        }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        self.status() == StatusCode::SERVICE_UNAVAILABLE
    }
}
