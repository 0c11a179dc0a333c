//! Engine error type and its mapping onto stable failure codes.

use relay_core::FailureCode;
use relay_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("message not found: {0}")]
    NotFound(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue not empty: {0}")]
    QueueNotEmpty(String),

    #[error("message {id} is {status}; operation requires processing")]
    InvalidState { id: String, status: String },

    #[error("lock lost for message {0}; another consumer owns it")]
    LockLost(String),

    #[error("update lost a concurrent race for message {0}")]
    UpdateFailed(String),

    #[error("validation: {0}")]
    Validation(String),

    #[error("batch rejected: {0}")]
    BatchRejected(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// The stable failure code for this error, when it represents a typed
    /// outcome rather than an internal fault.
    pub fn code(&self) -> Option<FailureCode> {
        match self {
            Self::NotFound(_) => Some(FailureCode::NotFound),
            Self::QueueNotFound(_) => Some(FailureCode::QueueNotFound),
            Self::QueueNotEmpty(_) => Some(FailureCode::QueueNotEmpty),
            Self::InvalidState { .. } => Some(FailureCode::InvalidState),
            Self::LockLost(_) => Some(FailureCode::LockLost),
            Self::UpdateFailed(_) => Some(FailureCode::UpdateFailed),
            Self::Validation(_) | Self::BatchRejected(_) => Some(FailureCode::Validation),
            Self::Storage(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_code_mapping() {
        assert_eq!(
            EngineError::NotFound("x".into()).code(),
            Some(FailureCode::NotFound)
        );
        assert_eq!(
            EngineError::LockLost("x".into()).code(),
            Some(FailureCode::LockLost)
        );
        assert_eq!(
            EngineError::QueueNotEmpty("q".into()).code(),
            Some(FailureCode::QueueNotEmpty)
        );
        assert_eq!(
            EngineError::UpdateFailed("x".into()).code(),
            Some(FailureCode::UpdateFailed)
        );
    }

    #[test]
    fn test_invalid_state_message_names_status() {
        let e = EngineError::InvalidState {
            id: "m1".into(),
            status: "acknowledged".into(),
        };
        assert!(e.to_string().contains("acknowledged"));
        assert_eq!(e.code(), Some(FailureCode::InvalidState));
    }
}
