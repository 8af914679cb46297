//! Per-thread runtime state.
//!
//! A [`ThreadEnvironment`] owns everything a workload thread touches that is
//! not shared: the engine session, one cursor per table, the random generator,
//! key/value scratch buffers, the usage bitmap and the optional latency
//! histogram. It borrows the [`Context`] and its [`Thread`] from the workload,
//! so it can never outlive a single run.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use bytes::BytesMut;
use hdrhistogram::Histogram;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use workgen_engine::{Connection, Cursor, EngineError, Session};

use crate::context::{Context, RecnoIndex};
use crate::error::{ConfigError, WorkgenError, WorkgenResult};
use crate::thread::{Thread, ThreadState};

/// How a thread has used a table so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage(u8);

impl Usage {
    /// Not touched.
    pub const NONE: Self = Self(0);
    /// Searched at least once.
    pub const READ: Self = Self(1);
    /// Inserted, updated or removed at least once.
    pub const WRITE: Self = Self(2);
    /// Both read and written.
    pub const MIXED: Self = Self(4);

    /// Returns true if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Returns the union of two usages.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        let bits = self.0 | other.0;
        if bits & Self::READ.0 != 0 && bits & Self::WRITE.0 != 0 {
            Self(bits | Self::MIXED.0)
        } else {
            Self(bits)
        }
    }

    /// Records one access.
    pub fn note(&mut self, write: bool) {
        *self = self.union(if write { Self::WRITE } else { Self::READ });
    }

    /// Returns true if the table was never touched.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.contains(Self::MIXED) {
            "mixed"
        } else if self.contains(Self::WRITE) {
            "write"
        } else if self.contains(Self::READ) {
            "read"
        } else {
            "none"
        };
        f.write_str(label)
    }
}

/// Declared access pattern for a table, checked after the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableIntent {
    /// No thread may write the table.
    ReadOnly,
    /// No thread may read the table.
    WriteOnly,
    /// Any mix is fine.
    Mixed,
}

impl TableIntent {
    /// Returns the intent as it is spelled in profiles.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "read-only",
            Self::WriteOnly => "write-only",
            Self::Mixed => "mixed",
        }
    }
}

/// Transaction outcomes observed by one thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnCounts {
    /// Transactions committed.
    pub commits: u64,
    /// Transactions rolled back, on request or after an error.
    pub rollbacks: u64,
}

impl TxnCounts {
    /// Adds another thread's counts into this one.
    pub fn add(&mut self, other: &Self) {
        self.commits += other.commits;
        self.rollbacks += other.rollbacks;
    }
}

/// Runtime state of one workload thread.
pub struct ThreadEnvironment<'a> {
    context: &'a Context,
    thread: &'a Thread,
    index: usize,
    state: ThreadState,
    session: Option<Box<dyn Session>>,
    cursors: Vec<Option<Box<dyn Cursor>>>,
    usage: Vec<Usage>,
    rng: ChaCha8Rng,
    pub(crate) key_buf: BytesMut,
    pub(crate) value_buf: BytesMut,
    error: Option<WorkgenError>,
    latency: Option<Histogram<u64>>,
    repeat: bool,
    validate_reads: bool,
    passes: u64,
    txns: TxnCounts,
}

impl<'a> ThreadEnvironment<'a> {
    /// Creates the environment for the thread at position `index`.
    ///
    /// The random generator is seeded from `seed + index`, so runs with the
    /// same seed replay the same key choices per thread.
    #[must_use]
    pub fn new(context: &'a Context, thread: &'a Thread, index: usize, seed: u64) -> Self {
        let (key_size, value_size) = thread.buffer_sizes();
        Self {
            context,
            thread,
            index,
            state: ThreadState::Created,
            session: None,
            cursors: std::iter::repeat_with(|| None)
                .take(context.table_count())
                .collect(),
            usage: vec![Usage::NONE; context.table_count()],
            rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(index as u64)),
            key_buf: BytesMut::with_capacity(key_size),
            value_buf: BytesMut::with_capacity(value_size),
            error: None,
            latency: None,
            repeat: false,
            validate_reads: false,
            passes: 0,
            txns: TxnCounts::default(),
        }
    }

    /// Enables latency recording for every engine call.
    #[must_use]
    pub fn with_latency_tracking(mut self, enabled: bool) -> Self {
        self.latency = if enabled {
            Histogram::<u64>::new(3).ok()
        } else {
            None
        };
        self
    }

    /// Enables value validation on searches.
    #[must_use]
    pub const fn with_read_validation(mut self, enabled: bool) -> Self {
        self.validate_reads = enabled;
        self
    }

    /// Opens the engine session.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the session cannot be opened.
    pub fn create(&mut self, conn: &dyn Connection) -> WorkgenResult<()> {
        let session = conn
            .open_session()
            .map_err(|e| WorkgenError::engine("open_session", e))?;
        self.session = Some(session);
        Ok(())
    }

    /// Opens one cursor for every table the thread's operations touch.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the session is missing or a cursor cannot
    /// be opened.
    pub fn open(&mut self) -> WorkgenResult<()> {
        let session = self.session.as_mut().ok_or_else(|| {
            WorkgenError::engine(
                "open_cursor",
                EngineError::InvalidState {
                    reason: "session not open",
                },
            )
        })?;
        for index in self.thread.table_indexes() {
            let slot = index.as_usize();
            if self.cursors.get(slot).is_some_and(Option::is_some) {
                continue;
            }
            let name = self
                .context
                .table_name(index)
                .ok_or_else(|| ConfigError::UnregisteredTable {
                    name: index.to_string(),
                })?;
            let cursor = session
                .open_cursor(name)
                .map_err(|e| WorkgenError::engine("open_cursor", e))?;
            if slot >= self.cursors.len() {
                self.cursors.resize_with(slot + 1, || None);
                self.usage.resize(slot + 1, Usage::NONE);
            }
            self.cursors[slot] = Some(cursor);
        }
        self.state = ThreadState::Open;
        debug!(thread = %self.thread.name(), cursors = self.open_cursor_count(), "environment open");
        Ok(())
    }

    /// Closes every cursor, then the session. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns the first engine error seen; every handle is still released.
    pub fn close(&mut self) -> WorkgenResult<()> {
        let mut first: Option<WorkgenError> = None;
        for slot in &mut self.cursors {
            if let Some(cursor) = slot.take() {
                if let Err(e) = cursor.close() {
                    warn!(thread = %self.thread.name(), error = %e, "cursor close failed");
                    first.get_or_insert(WorkgenError::engine("close_cursor", e));
                }
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close() {
                warn!(thread = %self.thread.name(), error = %e, "session close failed");
                first.get_or_insert(WorkgenError::engine("close_session", e));
            }
        }
        self.state = ThreadState::Closed;
        first.map_or(Ok(()), Err)
    }

    /// Returns the shared context.
    #[must_use]
    pub const fn context(&self) -> &'a Context {
        self.context
    }

    /// Returns the owning thread.
    #[must_use]
    pub const fn thread(&self) -> &'a Thread {
        self.thread
    }

    /// Returns the thread's position in the workload.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ThreadState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }

    /// Returns true if the thread replays its operations until stopped.
    #[must_use]
    pub const fn repeat(&self) -> bool {
        self.repeat
    }

    pub(crate) fn set_repeat(&mut self, repeat: bool) {
        self.repeat = repeat;
    }

    /// Returns true if searches validate the returned value.
    #[must_use]
    pub const fn validate_reads(&self) -> bool {
        self.validate_reads
    }

    /// Returns the number of completed passes over the operation list.
    #[must_use]
    pub const fn passes(&self) -> u64 {
        self.passes
    }

    pub(crate) fn set_passes(&mut self, passes: u64) {
        self.passes = passes;
    }

    /// Returns the transaction outcomes observed so far.
    #[must_use]
    pub const fn txn_counts(&self) -> TxnCounts {
        self.txns
    }

    pub(crate) fn note_commit(&mut self) {
        self.txns.commits += 1;
    }

    pub(crate) fn note_rollback(&mut self) {
        self.txns.rollbacks += 1;
    }

    /// Returns the error that stopped the thread, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&WorkgenError> {
        self.error.as_ref()
    }

    pub(crate) fn record_error(&mut self, error: WorkgenError) {
        self.error.get_or_insert(error);
    }

    /// Returns the usage bitmap, indexed by recno index.
    #[must_use]
    pub fn usage(&self) -> &[Usage] {
        &self.usage
    }

    pub(crate) fn note_usage(&mut self, index: RecnoIndex, write: bool) {
        if let Some(usage) = self.usage.get_mut(index.as_usize()) {
            usage.note(write);
        }
    }

    /// Returns the number of open cursors.
    #[must_use]
    pub fn open_cursor_count(&self) -> usize {
        self.cursors.iter().filter(|c| c.is_some()).count()
    }

    /// Returns the latency histogram, if tracking is enabled.
    #[must_use]
    pub const fn latency(&self) -> Option<&Histogram<u64>> {
        self.latency.as_ref()
    }

    pub(crate) fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    /// Returns a start timestamp when latency tracking is on.
    pub(crate) fn latency_start(&self) -> Option<Instant> {
        self.latency.as_ref().map(|_| Instant::now())
    }

    /// Records the microseconds elapsed since `started`.
    pub(crate) fn record_latency(&mut self, started: Option<Instant>) {
        if let (Some(hist), Some(started)) = (self.latency.as_mut(), started) {
            #[allow(clippy::cast_possible_truncation)] // microseconds fit in u64
            let micros = started.elapsed().as_micros() as u64;
            let _ = hist.record(micros.max(1));
        }
    }

    pub(crate) fn session_mut(&mut self) -> WorkgenResult<&mut Box<dyn Session>> {
        self.session.as_mut().ok_or_else(|| {
            WorkgenError::engine(
                "session",
                EngineError::InvalidState {
                    reason: "session not open",
                },
            )
        })
    }

    /// Splits out the cursor for a table together with the scratch buffers.
    pub(crate) fn cursor_and_buffers(
        &mut self,
        index: RecnoIndex,
    ) -> WorkgenResult<(&mut Box<dyn Cursor>, &BytesMut, &BytesMut)> {
        let cursor = self
            .cursors
            .get_mut(index.as_usize())
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                WorkgenError::engine(
                    "cursor",
                    EngineError::InvalidState {
                        reason: "cursor not open",
                    },
                )
            })?;
        Ok((cursor, &self.key_buf, &self.value_buf))
    }

    /// Checks the combined table usage of all threads against declared intents.
    ///
    /// Tables without a declared intent always pass.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UsageConflict`] for the first table whose usage
    /// contradicts its intent.
    pub fn cross_check(
        envs: &[ThreadEnvironment<'_>],
        context: &Context,
        intents: &HashMap<String, TableIntent>,
    ) -> Result<(), ConfigError> {
        for (slot, name) in context.table_names().iter().enumerate() {
            let Some(intent) = intents.get(name) else {
                continue;
            };
            let combined = envs
                .iter()
                .filter_map(|env| env.usage.get(slot).copied())
                .fold(Usage::NONE, Usage::union);
            let observed = match intent {
                TableIntent::ReadOnly if combined.contains(Usage::WRITE) => "wrote to it",
                TableIntent::WriteOnly if combined.contains(Usage::READ) => "read from it",
                _ => continue,
            };
            return Err(ConfigError::UsageConflict {
                table: name.clone(),
                declared: intent.as_str(),
                observed,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ThreadEnvironment<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEnvironment")
            .field("thread", &self.thread.name())
            .field("state", &self.state)
            .field("cursors", &self.open_cursor_count())
            .field("passes", &self.passes)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_becomes_mixed() {
        let mut usage = Usage::NONE;
        assert!(usage.is_empty());
        usage.note(false);
        assert!(usage.contains(Usage::READ));
        assert!(!usage.contains(Usage::MIXED));
        usage.note(true);
        assert!(usage.contains(Usage::WRITE));
        assert!(usage.contains(Usage::MIXED));
        assert_eq!(usage.to_string(), "mixed");
    }

    #[test]
    fn test_union_of_disjoint_threads_is_mixed() {
        let combined = Usage::READ.union(Usage::WRITE);
        assert!(combined.contains(Usage::MIXED));
        assert_eq!(Usage::WRITE.union(Usage::WRITE), Usage::WRITE);
    }

    #[test]
    fn test_lifecycle_states() {
        use crate::keygen::{Key, KeyType, Value};
        use crate::operation::{OpType, Operation};
        use crate::table::Table;
        use workgen_engine::MemoryConnection;

        let mut context = Context::new();
        let mut op = Operation::new(
            OpType::Insert,
            Table::new("table:env"),
            Key::new(KeyType::Append, 10).unwrap(),
            Value::new(20).unwrap(),
        );
        op.create_all(&mut context, false).unwrap();
        let thread = Thread::new(vec![op]);
        let conn = MemoryConnection::new();
        conn.create_table("table:env", "").unwrap();

        let mut env = ThreadEnvironment::new(&context, &thread, 0, 1);
        assert_eq!(env.state(), ThreadState::Created);
        assert!(env.session_mut().is_err());
        assert!(env.open().is_err());
        assert_eq!(conn.open_sessions(), 0);

        env.create(&conn).unwrap();
        assert_eq!(env.state(), ThreadState::Created);
        assert_eq!(conn.open_sessions(), 1);
        assert_eq!(env.open_cursor_count(), 0);

        env.open().unwrap();
        assert_eq!(env.state(), ThreadState::Open);
        assert_eq!(env.open_cursor_count(), 1);

        env.close().unwrap();
        assert_eq!(env.state(), ThreadState::Closed);
        assert_eq!(conn.open_sessions(), 0);
        assert_eq!(conn.open_cursors(), 0);
    }

    #[test]
    fn test_intent_spelling() {
        assert_eq!(TableIntent::ReadOnly.as_str(), "read-only");
        assert_eq!(TableIntent::WriteOnly.as_str(), "write-only");
    }
}
