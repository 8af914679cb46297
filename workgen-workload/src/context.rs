//! Record-number allocation shared by all workload threads.
//!
//! A [`Context`] maps each table name to a dense [`RecnoIndex`] and keeps one
//! atomic record-number counter per table. Names are registered while the
//! workload is being set up; during the run only the counters change, so the
//! only cross-thread synchronization is a single `fetch_add` per insert.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::ConfigError;

/// Source of process-unique context ids. Ids start at 1.
static CONTEXT_COUNT: AtomicU32 = AtomicU32::new(0);

/// Dense per-context index of a table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct RecnoIndex(u32);

impl RecnoIndex {
    /// Creates an index from a raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the value as a slot position.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RecnoIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "recno-{}", self.0)
    }
}

/// Tracks the current record number of every table in a workload.
#[derive(Debug)]
pub struct Context {
    id: u32,
    verbose: bool,
    indexes: HashMap<String, RecnoIndex>,
    names: Vec<String>,
    recnos: Vec<AtomicU64>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Creates an empty context with a fresh process-unique id.
    #[must_use]
    pub fn new() -> Self {
        let id = CONTEXT_COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        Self {
            id,
            verbose: false,
            indexes: HashMap::new(),
            names: Vec::new(),
            recnos: Vec::new(),
        }
    }

    /// Enables or disables per-thread progress logging.
    #[must_use]
    pub const fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Returns this context's process-unique id.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Returns true if verbose logging is enabled.
    #[must_use]
    pub const fn verbose(&self) -> bool {
        self.verbose
    }

    /// Returns the number of registered tables.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.names.len()
    }

    /// Registers a table name and returns its index.
    ///
    /// Idempotent: a known name returns its existing index. A new name gets
    /// the next dense index and a counter starting at zero.
    pub fn assign(&mut self, table_name: &str) -> RecnoIndex {
        if let Some(index) = self.indexes.get(table_name) {
            return *index;
        }
        #[allow(clippy::cast_possible_truncation)] // table count bounded by workload size
        let index = RecnoIndex::new(self.names.len() as u32);
        self.indexes.insert(table_name.to_string(), index);
        self.names.push(table_name.to_string());
        self.recnos.push(AtomicU64::new(0));
        index
    }

    /// Returns the index of a registered table.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnregisteredTable`] if the name was never assigned.
    pub fn index_of(&self, table_name: &str) -> Result<RecnoIndex, ConfigError> {
        self.indexes
            .get(table_name)
            .copied()
            .ok_or_else(|| ConfigError::UnregisteredTable {
                name: table_name.to_string(),
            })
    }

    /// Returns the table name for an index.
    #[must_use]
    pub fn table_name(&self, index: RecnoIndex) -> Option<&str> {
        self.names.get(index.as_usize()).map(String::as_str)
    }

    /// Returns the registered table names in index order.
    #[must_use]
    pub fn table_names(&self) -> &[String] {
        &self.names
    }

    /// Mints the next record number for a table.
    ///
    /// Record numbers start at 1 and are never handed out twice, whatever the
    /// number of threads calling concurrently.
    ///
    /// # Panics
    ///
    /// Panics if the index did not come from this context.
    #[inline]
    pub fn next_recno(&self, index: RecnoIndex) -> u64 {
        self.recnos[index.as_usize()].fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the highest record number minted so far for a table.
    ///
    /// # Panics
    ///
    /// Panics if the index did not come from this context.
    #[inline]
    #[must_use]
    pub fn current_max(&self, index: RecnoIndex) -> u64 {
        self.recnos[index.as_usize()].load(Ordering::Relaxed)
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context: id {}, verbose {}", self.id, self.verbose)?;
        for (name, recno) in self.names.iter().zip(&self.recnos) {
            write!(f, ", {name}={}", recno.load(Ordering::Relaxed))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_is_idempotent_and_dense() {
        let mut ctx = Context::new();
        let a = ctx.assign("table:a");
        let b = ctx.assign("table:b");
        assert_eq!(ctx.assign("table:a"), a);
        assert_eq!(a.get(), 0);
        assert_eq!(b.get(), 1);
        assert_eq!(ctx.table_count(), 2);
        assert_eq!(ctx.table_name(b), Some("table:b"));
    }

    #[test]
    fn test_unregistered_table() {
        let ctx = Context::new();
        assert_eq!(
            ctx.index_of("table:missing"),
            Err(ConfigError::UnregisteredTable {
                name: "table:missing".to_string()
            })
        );
    }

    #[test]
    fn test_next_recno_monotonic() {
        let mut ctx = Context::new();
        let index = ctx.assign("table:a");
        assert_eq!(ctx.current_max(index), 0);
        assert_eq!(ctx.next_recno(index), 1);
        assert_eq!(ctx.next_recno(index), 2);
        assert_eq!(ctx.current_max(index), 2);
    }

    #[test]
    fn test_context_ids_unique() {
        let a = Context::new();
        let b = Context::new();
        assert_ne!(a.id(), b.id());
        assert!(a.id() >= 1);
    }

    #[test]
    fn test_concurrent_next_recno_has_no_gaps() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 2_000;

        let mut ctx = Context::new();
        let index = ctx.assign("table:hot");

        let mut minted: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let ctx = &ctx;
                    s.spawn(move || {
                        (0..PER_THREAD)
                            .map(|_| ctx.next_recno(index))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        minted.sort_unstable();
        let expected: Vec<u64> = (1..=THREADS * PER_THREAD).collect();
        assert_eq!(minted, expected);
        assert_eq!(ctx.current_max(index), THREADS * PER_THREAD);
    }
}
