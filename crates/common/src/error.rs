//! Common error types.

use thiserror::Error;

/// Error type shared by every engine component.
///
/// The variants follow the DOM exception names a media host expects
/// (`NotFoundError`, `InvalidStateError`, ...), so a failure can be handed
/// back across the host boundary without losing its category.
#[derive(Error, Clone, Debug, PartialEq)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Range error: {0}")]
    Range(String),

    #[error("Capacity exceeded: {count} entries, at most {max} allowed")]
    Capacity { count: usize, max: usize },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }

    pub fn capacity(count: usize, max: usize) -> Self {
        Self::Capacity { count, max }
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Status reported to the host. Zero is reserved for success.
    pub fn status_code(&self) -> i32 {
        match self {
            EngineError::NotFound(_) => 1,
            EngineError::InvalidState(_) => 2,
            EngineError::Range(_) => 3,
            EngineError::Capacity { .. } => 4,
            EngineError::Network(_) => 5,
            EngineError::NotSupported(_) => 6,
            EngineError::Internal(_) => 7,
        }
    }

    /// DOM exception name for this error.
    pub fn name(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "NotFoundError",
            EngineError::InvalidState(_) => "InvalidStateError",
            EngineError::Range(_) => "RangeError",
            EngineError::Capacity { .. } => "CapacityError",
            EngineError::Network(_) => "NetworkError",
            EngineError::NotSupported(_) => "NotSupportedError",
            EngineError::Internal(_) => "InternalError",
        }
    }
}
