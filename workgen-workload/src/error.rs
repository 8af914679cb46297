//! Workload error types.
//!
//! Configuration problems are reported before any thread starts. Engine
//! failures are fatal to the thread that hit them. A "not found" from the
//! engine is never an error here: it is counted as a failed read.

use thiserror::Error;
use workgen_engine::EngineError;

/// Result type for workload operations.
pub type WorkgenResult<T> = Result<T, WorkgenError>;

/// Errors that can occur while building or running a workload.
#[derive(Debug, Clone, Error)]
pub enum WorkgenError {
    /// The workload description is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A storage engine call failed.
    #[error("engine error during {operation} (code {code}): {source}", code = .source.code())]
    Engine {
        /// Which engine call failed.
        operation: &'static str,
        /// Error returned by the engine.
        source: EngineError,
    },

    /// The engine returned data that record-number allocation rules out.
    #[error("integrity error on {table} record {recno}: {detail}")]
    Integrity {
        /// Table name.
        table: String,
        /// Record number involved.
        recno: u64,
        /// What was observed.
        detail: &'static str,
    },

    /// A workload thread failed; wraps the first error seen.
    #[error("thread {thread} failed: {source}")]
    ThreadFailed {
        /// Name of the failing thread.
        thread: String,
        /// The thread's error.
        source: Box<WorkgenError>,
    },
}

impl WorkgenError {
    /// Creates an engine error for the named call.
    #[must_use]
    pub const fn engine(operation: &'static str, source: EngineError) -> Self {
        Self::Engine { operation, source }
    }

    /// Returns true if this is (or wraps) an integrity error.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Integrity { .. } => true,
            Self::ThreadFailed { source, .. } => source.is_integrity(),
            _ => false,
        }
    }

    /// Returns the engine error, if this is (or wraps) one.
    #[must_use]
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::Engine { source, .. } => Some(source),
            Self::ThreadFailed { source, .. } => source.engine_error(),
            _ => None,
        }
    }
}

/// Invalid workload descriptions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Key size cannot hold any record number.
    #[error("key size {size} too small, need at least {min}")]
    KeySizeTooSmall {
        /// Configured size.
        size: usize,
        /// Minimum size.
        min: usize,
    },

    /// Value size cannot hold any record number.
    #[error("value size {size} too small, need at least {min}")]
    ValueSizeTooSmall {
        /// Configured size.
        size: usize,
        /// Minimum size.
        min: usize,
    },

    /// A record number does not fit in the configured key or value size.
    #[error("{what} ({recno}) too large for size ({size})")]
    RecnoOutOfRange {
        /// "key" or "value".
        what: &'static str,
        /// The record number.
        recno: u64,
        /// Configured size.
        size: usize,
    },

    /// Pareto skew parameters out of range.
    #[error("invalid pareto skew: hot fraction {hot_fraction}, mass fraction {mass_fraction}")]
    InvalidSkew {
        /// Fraction of the key range that is hot, in (0, 1].
        hot_fraction: String,
        /// Fraction of accesses landing in the hot range, in [0, 1].
        mass_fraction: String,
    },

    /// A table name was never registered with the context.
    #[error("table {name} is not registered with the context")]
    UnregisteredTable {
        /// Table name.
        name: String,
    },

    /// A table is bound to a different context than the one running it.
    #[error("table {table} belongs to context {bound}, not context {running}")]
    ContextMismatch {
        /// Table name.
        table: String,
        /// Context the table was registered with.
        bound: u32,
        /// Context running the operation.
        running: u32,
    },

    /// An operation with no table.
    #[error("{op} operation requires a table")]
    MissingTable {
        /// Operation type.
        op: &'static str,
    },

    /// Insert and update operations need a value generator.
    #[error("{op} operation requires a value")]
    MissingValue {
        /// Operation type.
        op: &'static str,
    },

    /// A table name was empty.
    #[error("table name is empty")]
    EmptyTableName,

    /// A transaction was nested inside another transaction.
    #[error("nested transaction under table {table}")]
    NestedTransaction {
        /// Table of the inner operation, or "none" for grouping nodes.
        table: String,
    },

    /// Observed access pattern contradicts the declared intent.
    #[error("table {table} declared {declared} but threads {observed}")]
    UsageConflict {
        /// Table name.
        table: String,
        /// Declared intent.
        declared: &'static str,
        /// What was observed.
        observed: &'static str,
    },

    /// The workload has nothing to run.
    #[error("workload has no threads")]
    NoThreads,

    /// A thread repeats until stopped but the run has no time limit.
    #[error("thread {thread} repeats until stopped but run_time is 0")]
    UnboundedThread {
        /// Thread name.
        thread: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display_includes_code() {
        let err = WorkgenError::engine("search", EngineError::DuplicateKey);
        let msg = err.to_string();
        assert!(msg.contains("search"));
        assert!(msg.contains("-31801"));
    }

    #[test]
    fn test_thread_failed_unwraps() {
        let inner = WorkgenError::Integrity {
            table: "table:t".to_string(),
            recno: 7,
            detail: "duplicate key on insert",
        };
        let err = WorkgenError::ThreadFailed {
            thread: "thread0".to_string(),
            source: Box::new(inner),
        };
        assert!(err.is_integrity());
        assert!(err.engine_error().is_none());
        assert!(err.to_string().contains("thread0"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::RecnoOutOfRange {
            what: "key",
            recno: 1000,
            size: 4,
        };
        assert_eq!(err.to_string(), "key (1000) too large for size (4)");
    }
}
