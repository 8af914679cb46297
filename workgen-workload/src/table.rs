//! Tables and their throughput statistics.
//!
//! Live counters are atomics shared by every clone of a [`Table`], so threads
//! can bump them without locks while the reporting loop reads them. Reports
//! never work on the live counters directly: they take a [`TableStats`]
//! snapshot and compute deltas between snapshots.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::RecnoIndex;

/// The kind of counter an executed action bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// A successful insert.
    Insert,
    /// A successful search.
    Read,
    /// A search, update or remove whose key was missing.
    FailedRead,
    /// A successful remove.
    Remove,
    /// A successful update.
    Update,
    /// A truncate.
    Truncate,
}

/// A snapshot of table counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Successful inserts.
    pub inserts: u64,
    /// Successful searches.
    pub reads: u64,
    /// Operations whose key was not found.
    pub failed_reads: u64,
    /// Successful removes.
    pub removes: u64,
    /// Successful updates.
    pub updates: u64,
    /// Truncates.
    pub truncates: u64,
}

impl TableStats {
    /// Adds another snapshot into this one.
    pub fn add(&mut self, other: &Self) {
        self.inserts += other.inserts;
        self.reads += other.reads;
        self.failed_reads += other.failed_reads;
        self.removes += other.removes;
        self.updates += other.updates;
        self.truncates += other.truncates;
    }

    /// Subtracts an earlier snapshot, leaving the delta.
    ///
    /// Each counter saturates at zero.
    pub fn subtract(&mut self, other: &Self) {
        self.inserts = self.inserts.saturating_sub(other.inserts);
        self.reads = self.reads.saturating_sub(other.reads);
        self.failed_reads = self.failed_reads.saturating_sub(other.failed_reads);
        self.removes = self.removes.saturating_sub(other.removes);
        self.updates = self.updates.saturating_sub(other.updates);
        self.truncates = self.truncates.saturating_sub(other.truncates);
    }

    /// Resets every counter to zero.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Bumps one counter.
    pub fn record(&mut self, kind: StatKind) {
        match kind {
            StatKind::Insert => self.inserts += 1,
            StatKind::Read => self.reads += 1,
            StatKind::FailedRead => self.failed_reads += 1,
            StatKind::Remove => self.removes += 1,
            StatKind::Update => self.updates += 1,
            StatKind::Truncate => self.truncates += 1,
        }
    }

    /// Returns the number of completed operations, excluding failed reads.
    #[must_use]
    pub const fn total_ops(&self) -> u64 {
        self.inserts + self.reads + self.removes + self.updates + self.truncates
    }

    /// Returns the delta between this snapshot and an earlier one.
    #[must_use]
    pub fn since(&self, earlier: &Self) -> Self {
        let mut delta = *self;
        delta.subtract(earlier);
        delta
    }

    /// Formats the counters as per-second rates over `elapsed`.
    #[must_use]
    pub fn rates(&self, elapsed: Duration) -> String {
        format!(
            "inserts={} reads={} failed_reads={} updates={} removes={} truncates={}",
            ops_per_sec(self.inserts, elapsed),
            ops_per_sec(self.reads, elapsed),
            ops_per_sec(self.failed_reads, elapsed),
            ops_per_sec(self.updates, elapsed),
            ops_per_sec(self.removes, elapsed),
            ops_per_sec(self.truncates, elapsed),
        )
    }

    /// Formats the raw counts in one line.
    #[must_use]
    pub fn report(&self) -> String {
        format!(
            "{} reads, {} inserts, {} updates, {} truncates, {} removes",
            self.reads, self.inserts, self.updates, self.truncates, self.removes
        )
    }

    /// Formats the end-of-run breakdown, one line per operation type.
    #[must_use]
    pub fn final_report(&self, elapsed: Duration) -> Vec<String> {
        let ops = self.total_ops();
        [
            (self.reads, "read"),
            (self.inserts, "insert"),
            (self.updates, "update"),
            (self.truncates, "truncate"),
            (self.removes, "remove"),
        ]
        .into_iter()
        .map(|(count, singular)| {
            format!(
                "Executed {count} {singular} operations ({}%) {} ops/sec",
                pct(count, ops),
                ops_per_sec(count, elapsed)
            )
        })
        .collect()
    }
}

impl fmt::Display for TableStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TableStats: reads {}, failed_reads {}, inserts {}, updates {}, truncates {}, removes {}",
            self.reads, self.failed_reads, self.inserts, self.updates, self.truncates, self.removes
        )
    }
}

/// Integer percentage, zero when the total is zero.
#[must_use]
pub const fn pct(n: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        n * 100 / total
    }
}

/// Whole operations per second, zero for an empty interval.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn ops_per_sec(ops: u64, elapsed: Duration) -> u64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        0
    } else {
        (ops as f64 / secs) as u64
    }
}

/// Live counters for one table.
#[derive(Debug, Default)]
pub struct StatsCounters {
    inserts: AtomicU64,
    reads: AtomicU64,
    failed_reads: AtomicU64,
    removes: AtomicU64,
    updates: AtomicU64,
    truncates: AtomicU64,
}

impl StatsCounters {
    fn counter(&self, kind: StatKind) -> &AtomicU64 {
        match kind {
            StatKind::Insert => &self.inserts,
            StatKind::Read => &self.reads,
            StatKind::FailedRead => &self.failed_reads,
            StatKind::Remove => &self.removes,
            StatKind::Update => &self.updates,
            StatKind::Truncate => &self.truncates,
        }
    }

    /// Bumps one counter.
    #[inline]
    pub fn record(&self, kind: StatKind) {
        self.counter(kind).fetch_add(1, Ordering::Relaxed);
    }

    /// Reads all counters into a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> TableStats {
        TableStats {
            inserts: self.inserts.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            truncates: self.truncates.load(Ordering::Relaxed),
        }
    }

    /// Resets every counter to zero.
    pub fn clear(&self) {
        for kind in [
            StatKind::Insert,
            StatKind::Read,
            StatKind::FailedRead,
            StatKind::Remove,
            StatKind::Update,
            StatKind::Truncate,
        ] {
            self.counter(kind).store(0, Ordering::Relaxed);
        }
    }
}

/// Registration of a table with a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableBinding {
    /// Id of the context that registered the table.
    pub context_id: u32,
    /// Index assigned by that context.
    pub recno_index: RecnoIndex,
}

/// A named storage-engine table.
///
/// Clones share the same live counters.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    stats: Arc<StatsCounters>,
    binding: Option<TableBinding>,
}

impl Table {
    /// Creates a table handle with fresh counters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stats: Arc::new(StatsCounters::default()),
            binding: None,
        }
    }

    /// Returns the table name (the engine URI).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the live counters.
    #[must_use]
    pub fn stats(&self) -> &StatsCounters {
        &self.stats
    }

    /// Returns the shared counters handle.
    #[must_use]
    pub(crate) fn stats_handle(&self) -> &Arc<StatsCounters> {
        &self.stats
    }

    /// Returns the context registration, if any.
    #[must_use]
    pub const fn binding(&self) -> Option<TableBinding> {
        self.binding
    }

    /// Records the registration by a context. The latest registration wins.
    pub fn bind(&mut self, context_id: u32, recno_index: RecnoIndex) {
        self.binding = Some(TableBinding {
            context_id,
            recno_index,
        });
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table: {}", self.name)
    }
}
