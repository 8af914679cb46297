//! Workgen Workload: synthetic key/value load generation
//!
//! Drives a storage engine with concurrent insert, search, update and remove
//! traffic described as trees of operations, and reports throughput while
//! the run is in progress and at the end.
//!
//! # Architecture
//!
//! - [`Context`] mints record numbers per table, shared by every thread
//! - [`Key`] and [`Value`] turn record numbers into bytes
//! - [`Operation`] trees, optionally wrapped in a [`Transaction`], are
//!   replayed by each [`Thread`] in its own [`ThreadEnvironment`]
//! - [`Workload`] creates, runs, reports and tears down
//!
//! The engine itself sits behind the [`workgen_engine::Connection`] trait.
//!
//! # Example
//!
//! ```ignore
//! use workgen_engine::MemoryConnection;
//! use workgen_workload::{Context, Key, KeyType, Operation, OpType, Table, Thread, Value, Workload};
//!
//! let ops = vec![Operation::new(
//!     OpType::Insert,
//!     Table::new("table:simple"),
//!     Key::new(KeyType::Append, 10)?,
//!     Value::new(40)?,
//! )];
//! let mut workload = Workload::new(Context::new(), vec![Thread::new(ops)]);
//! let summary = workload.run(&MemoryConnection::new())?;
//! assert_eq!(summary.totals.inserts, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod context;
mod environment;
mod error;
mod keygen;
mod operation;
mod report;
mod table;
mod thread;
mod transaction;
mod workload;

pub mod profiles;

pub use context::{Context, RecnoIndex};
pub use environment::{TableIntent, ThreadEnvironment, TxnCounts, Usage};
pub use error::{ConfigError, WorkgenError, WorkgenResult};
pub use keygen::{Key, KeyType, ParetoSkew, Value, MIN_KV_SIZE};
pub use operation::{OpType, Operation};
pub use report::{IntervalReport, LatencySummary, Reporter, RunSummary, ThreadSummary};
pub use table::{StatKind, StatsCounters, Table, TableBinding, TableStats};
pub use thread::{Thread, ThreadState};
pub use transaction::Transaction;
pub use workload::{Workload, WorkloadBuilder, WorkloadConfig, DEFAULT_TABLE_CONFIG};
