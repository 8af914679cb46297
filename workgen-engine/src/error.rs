//! Storage engine error types.
//!
//! Every engine call is fallible. Errors carry a stable numeric code so the
//! workload layer can report them the way the engine would.

use thiserror::Error;

/// Result type for storage engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Numeric code for a missing key.
pub const NOT_FOUND_CODE: i32 = -31_803;

/// Numeric code for an insert on an existing key.
pub const DUPLICATE_KEY_CODE: i32 = -31_801;

/// Numeric code for a transaction the engine had to abort.
pub const ROLLBACK_CODE: i32 = -31_800;

/// Errors returned by a storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The key does not exist.
    #[error("item not found")]
    NotFound,

    /// The key already exists and overwrite is not allowed.
    #[error("attempt to insert an existing key")]
    DuplicateKey,

    /// The engine aborted the transaction.
    #[error("transaction rolled back: {reason}")]
    Rollback {
        /// Why the engine aborted.
        reason: String,
    },

    /// The named table does not exist.
    #[error("no such table: {uri}")]
    NoSuchTable {
        /// Table URI that was requested.
        uri: String,
    },

    /// The call is not valid in the handle's current state.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// What was wrong.
        reason: &'static str,
    },

    /// An I/O failure inside the engine.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

impl EngineError {
    /// Creates an I/O error.
    pub fn io(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Io {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns the engine's numeric error code.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::NotFound => NOT_FOUND_CODE,
            Self::DuplicateKey => DUPLICATE_KEY_CODE,
            Self::Rollback { .. } => ROLLBACK_CODE,
            Self::NoSuchTable { .. } => 2,
            Self::InvalidState { .. } => 22,
            Self::Io { .. } => 5,
        }
    }

    /// Returns true if this error only means the key was missing.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Returns true if this error is a duplicate-key rejection.
    #[must_use]
    pub const fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey)
    }
}
