//! Workgen Engine: the storage engine seam for the workload generator.
//!
//! The workload generator drives a key/value storage engine through three
//! handle types, mirroring how embedded engines are usually exposed:
//!
//! - [`Connection`]: process-wide handle, creates tables and opens sessions
//! - [`Session`]: single-threaded context owning transactions and cursors
//! - [`Cursor`]: positioned access to one table inside a session
//!
//! # Available Backends
//!
//! - [`MemoryConnection`]: in-memory engine with transactional buffering and
//!   deterministic fault injection, used for testing the workload engine
//!
//! # Example
//!
//! ```ignore
//! use workgen_engine::{Connection, MemoryConnection};
//!
//! let conn = MemoryConnection::new();
//! conn.create_table("table:example", "")?;
//! let mut session = conn.open_session()?;
//! let mut cursor = session.open_cursor("table:example")?;
//! cursor.insert(b"0001", b"hello")?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod memory;

use bytes::Bytes;

pub use error::{
    EngineError, EngineResult, DUPLICATE_KEY_CODE, NOT_FOUND_CODE, ROLLBACK_CODE,
};
pub use memory::{FaultConfig, FaultStats, MemoryConnection};

/// A connection to a storage engine.
///
/// Implementations must be `Send + Sync`: one connection is shared by every
/// workload thread, each of which opens its own session.
pub trait Connection: Send + Sync {
    /// Creates a table if it does not already exist.
    ///
    /// The configuration string is opaque to the caller.
    ///
    /// # Errors
    /// Returns an error if the table cannot be created.
    fn create_table(&self, uri: &str, config: &str) -> EngineResult<()>;

    /// Opens a new session.
    ///
    /// # Errors
    /// Returns an error if the session cannot be opened.
    fn open_session(&self) -> EngineResult<Box<dyn Session>>;
}

/// A session: the unit of single-threaded access to the engine.
///
/// A session is moved to the thread that uses it and is never shared.
pub trait Session: Send {
    /// Opens a cursor on the named table.
    ///
    /// # Errors
    /// Returns [`EngineError::NoSuchTable`] if the table does not exist.
    fn open_cursor(&mut self, uri: &str) -> EngineResult<Box<dyn Cursor>>;

    /// Starts a transaction. The configuration string is opaque.
    ///
    /// # Errors
    /// Returns an error if a transaction is already active.
    fn begin_transaction(&mut self, config: &str) -> EngineResult<()>;

    /// Commits the active transaction.
    ///
    /// # Errors
    /// Returns an error if no transaction is active or the commit fails. A
    /// failed commit leaves no transaction active.
    fn commit_transaction(&mut self, config: &str) -> EngineResult<()>;

    /// Rolls back the active transaction, discarding its writes.
    ///
    /// # Errors
    /// Returns an error if no transaction is active.
    fn rollback_transaction(&mut self) -> EngineResult<()>;

    /// Returns true while a transaction is active.
    fn in_transaction(&self) -> bool;

    /// Closes the session. Cursors opened from it must be closed first.
    ///
    /// # Errors
    /// Returns an error if the session cannot be closed cleanly.
    fn close(self: Box<Self>) -> EngineResult<()>;
}

/// Positioned access to a single table.
///
/// Writes made while the owning session has an active transaction become
/// visible to other sessions only at commit.
pub trait Cursor: Send {
    /// Returns the URI of the table this cursor is open on.
    fn uri(&self) -> &str;

    /// Inserts a new record.
    ///
    /// # Errors
    /// Returns [`EngineError::DuplicateKey`] if the key already exists.
    fn insert(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Replaces the value of an existing record.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] if the key does not exist.
    fn update(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Removes an existing record.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] if the key does not exist.
    fn remove(&mut self, key: &[u8]) -> EngineResult<()>;

    /// Looks up a record and returns its value.
    ///
    /// # Errors
    /// Returns [`EngineError::NotFound`] if the key does not exist.
    fn search(&mut self, key: &[u8]) -> EngineResult<Bytes>;

    /// Closes the cursor.
    ///
    /// # Errors
    /// Returns an error if the cursor cannot be closed cleanly.
    fn close(self: Box<Self>) -> EngineResult<()>;
}
