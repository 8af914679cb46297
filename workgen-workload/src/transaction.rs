//! Transaction configuration for operation subtrees.

use std::fmt;

/// Begin/commit settings wrapping an operation and its children.
///
/// The configuration strings are handed to the engine unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Roll back instead of committing, whatever the outcome.
    pub rollback: bool,
    /// Configuration passed to `begin_transaction`.
    pub begin_config: String,
    /// Configuration passed to `commit_transaction`.
    pub commit_config: String,
}

impl Transaction {
    /// Creates a committing transaction with the given begin configuration.
    #[must_use]
    pub fn new(begin_config: impl Into<String>) -> Self {
        Self {
            rollback: false,
            begin_config: begin_config.into(),
            commit_config: String::new(),
        }
    }

    /// Creates a transaction that always rolls back.
    #[must_use]
    pub fn rollback() -> Self {
        Self {
            rollback: true,
            ..Self::default()
        }
    }

    /// Sets the commit configuration.
    #[must_use]
    pub fn with_commit_config(mut self, config: impl Into<String>) -> Self {
        self.commit_config = config.into();
        self
    }

    /// Sets the rollback flag.
    #[must_use]
    pub const fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback = rollback;
        self
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction: ")?;
        if self.rollback {
            write!(f, "(rollback) ")?;
        }
        write!(f, "begin_config: {}", self.begin_config)?;
        if !self.commit_config.is_empty() {
            write!(f, ", commit_config: {}", self.commit_config)?;
        }
        Ok(())
    }
}
