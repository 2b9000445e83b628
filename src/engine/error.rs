use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// Carries the id of the appointment the request collided with.
    #[error("conflict with appointment: {0}")]
    Conflict(Ulid),
    #[error("store deadline exceeded")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => "invalid_argument",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) | EngineError::AlreadyExists(_) => "conflict",
            EngineError::Timeout => "timeout",
            EngineError::Unavailable(_) => "unavailable",
        }
    }

    /// Status an HTTP front-end would answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => 400,
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(_) | EngineError::AlreadyExists(_) => 409,
            EngineError::Timeout | EngineError::Unavailable(_) => 500,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) | EngineError::LimitExceeded(_) => "22023",
            EngineError::NotFound(_) => "P0002",
            EngineError::Conflict(_) => "23P01",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::Timeout => "57014",
            EngineError::Unavailable(_) => "58000",
        }
    }

    /// Conflicts are final: the caller has to re-query slots instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Unavailable(_))
    }
}
