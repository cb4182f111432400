use rusqlite::ErrorCode;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The store could not complete the operation. Transient failures
    /// (busy/locked database) are worth retrying with backoff.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),

    #[error("no eligible items")]
    NoEligibleItems,

    /// Malformed input, rejected before any state is written.
    #[error("invalid attempt: {0}")]
    InvalidAttempt(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidAttempt(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::StorageUnavailable(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    // Maps a unique-constraint failure onto `Duplicate`, leaving other errors as storage errors.
    pub(crate) fn from_insert(err: rusqlite::Error, what: &str) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                EngineError::Duplicate(what.to_string())
            }
            _ => EngineError::StorageUnavailable(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
