//! Stable failure codes shared between the engine and its transports.
//!
//! Codes are string constants: transports map them to wire status codes,
//! tests assert on them, and they never change meaning once published.

use serde::{Deserialize, Serialize};

/// Tagged outcome codes for engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCode {
    /// Target message absent.
    NotFound,
    /// Named queue absent.
    QueueNotFound,
    /// Queue delete refused because non-terminal messages exist.
    QueueNotEmpty,
    /// Operation disallowed for the row's current status.
    InvalidState,
    /// Fencing token mismatch; another consumer owns the row now.
    LockLost,
    /// A concurrent transition won the race; caller may reread and retry.
    UpdateFailed,
    /// Input outside the allowed range; not retryable.
    Validation,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::QueueNotFound => "QUEUE_NOT_FOUND",
            Self::QueueNotEmpty => "QUEUE_NOT_EMPTY",
            Self::InvalidState => "INVALID_STATE",
            Self::LockLost => "LOCK_LOST",
            Self::UpdateFailed => "UPDATE_FAILED",
            Self::Validation => "VALIDATION",
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
