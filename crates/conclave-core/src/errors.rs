use thiserror::Error;

/// Errors the HTTP boundary maps to status codes. Everything else stays
/// internal and surfaces as `Internal`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("daily quota exhausted")]
    QuotaExceeded,
    #[error("task not found")]
    NotFound,
    #[error("task belongs to another user")]
    NotOwner,
    #[error("task is in state `{current}`")]
    WrongStatus { current: String },
    #[error("invalid intermediate state: {0}")]
    InvalidState(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
