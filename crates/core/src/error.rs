use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PostloopError>;

#[derive(Debug, Error)]
pub enum PostloopError {
    /// Required context or credential is missing. Fatal for the call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or provider failure.
    #[error("External service error: {0}")]
    TransientExternal(String),

    /// An expected linked record (e.g. the action behind a reward) is missing or corrupt.
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    /// An external generator answered with something other than the agreed structure.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown job type or an undecodable payload.
    #[error("Malformed job: {0}")]
    MalformedJob(String),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PostloopError {
    /// Whether the job queue should spend a retry on this failure.
    ///
    /// Configuration problems and missing linked data do not heal by waiting,
    /// so jobs hitting them go straight to `failed`.
    pub fn is_retryable(&self) -> bool {
        match self {
            PostloopError::Configuration(_)
            | PostloopError::DataIntegrity(_)
            | PostloopError::MalformedJob(_) => false,
            PostloopError::TransientExternal(_)
            | PostloopError::Validation(_)
            | PostloopError::Db(_)
            | PostloopError::Json(_)
            | PostloopError::Io(_) => true,
        }
    }
}
