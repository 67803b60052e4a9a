//! Error types for serendip.
//!
//! Quota shortfall and duplicate candidates are normal outcomes and never
//! surface here.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias using serendip's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("mining run {0} does not exist")]
    RunNotFound(Uuid),

    /// Too few claims or observations to sample or aggregate.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// A unit of work ran past its wall-clock budget (milliseconds).
    #[error("unit of work exceeded its {0} ms budget")]
    Timeout(u64),

    /// Another run holds the single in-progress slot.
    #[error("mining run {0} is already in progress")]
    ConcurrentRun(Uuid),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether re-running the same batch from the persisted cursor can
    /// succeed. Bad parameters, missing data and lost runs will fail again.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidInput(_)
                | Error::InsufficientData(_)
                | Error::RunNotFound(_)
                | Error::ConcurrentRun(_)
                | Error::Config(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
