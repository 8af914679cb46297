//! Statistics aggregation and report formatting.
//!
//! The orchestrator snapshots every table's live counters at each report
//! boundary and prints the delta since the previous snapshot. The final
//! summary carries the totals plus the tail delta accumulated after the last
//! interval report, so the interval deltas and the tail always add up to the
//! totals.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use tracing::{info, warn};

use crate::context::Context;
use crate::environment::TxnCounts;
use crate::table::{StatsCounters, TableStats};
use crate::thread::Thread;

/// Live counters of every table in a workload, grouped by table name.
///
/// Distinct [`crate::Table`] handles with the same name are summed; clones
/// sharing one counter set are counted once.
#[derive(Debug, Default)]
pub(crate) struct StatsRegistry {
    tables: Vec<(String, Vec<Arc<StatsCounters>>)>,
}

impl StatsRegistry {
    /// Collects the counters of every bound table, in context index order.
    pub(crate) fn collect(context: &Context, threads: &[Thread]) -> Self {
        let mut tables: Vec<(String, Vec<Arc<StatsCounters>>)> = context
            .table_names()
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for thread in threads {
            for op in thread.ops() {
                op.visit_tables(&mut |table| {
                    let Some(binding) = table.binding() else {
                        return;
                    };
                    if binding.context_id != context.id() {
                        return;
                    }
                    if let Some((_, counters)) = tables.get_mut(binding.recno_index.as_usize()) {
                        let handle = table.stats_handle();
                        if !counters.iter().any(|c| Arc::ptr_eq(c, handle)) {
                            counters.push(Arc::clone(handle));
                        }
                    }
                });
            }
        }
        tables.retain(|(_, counters)| !counters.is_empty());
        Self { tables }
    }

    /// Resets every counter.
    pub(crate) fn clear(&self) {
        for (_, counters) in &self.tables {
            for c in counters {
                c.clear();
            }
        }
    }

    /// Reads every counter.
    pub(crate) fn snapshot(&self) -> Snapshot {
        let mut total = TableStats::default();
        let tables = self
            .tables
            .iter()
            .map(|(name, counters)| {
                let mut stats = TableStats::default();
                for c in counters {
                    stats.add(&c.snapshot());
                }
                total.add(&stats);
                (name.clone(), stats)
            })
            .collect();
        Snapshot { tables, total }
    }
}

/// Point-in-time copy of every table's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) tables: Vec<(String, TableStats)>,
    pub(crate) total: TableStats,
}

impl Snapshot {
    /// Returns the per-table and total deltas since an earlier snapshot.
    pub(crate) fn since(&self, earlier: &Self) -> Self {
        let tables = self
            .tables
            .iter()
            .zip(&earlier.tables)
            .map(|((name, now), (_, then))| (name.clone(), now.since(then)))
            .collect();
        Self {
            tables,
            total: self.total.since(&earlier.total),
        }
    }
}

/// Counters accumulated during one report interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalReport {
    /// Time since the run started when the report was taken.
    pub at: Duration,
    /// Length of the interval the deltas cover.
    pub interval: Duration,
    /// Per-table deltas.
    pub tables: Vec<(String, TableStats)>,
    /// Sum of the per-table deltas.
    pub total: TableStats,
}

/// Latency percentiles over every engine call, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    /// Number of recorded calls.
    pub count: u64,
    /// Median.
    pub p50_us: u64,
    /// 95th percentile.
    pub p95_us: u64,
    /// 99th percentile.
    pub p99_us: u64,
    /// Slowest call.
    pub max_us: u64,
}

impl LatencySummary {
    /// Summarizes a histogram; `None` when it is empty.
    #[must_use]
    pub fn from_histogram(hist: &Histogram<u64>) -> Option<Self> {
        if hist.is_empty() {
            return None;
        }
        Some(Self {
            count: hist.len(),
            p50_us: hist.value_at_quantile(0.50),
            p95_us: hist.value_at_quantile(0.95),
            p99_us: hist.value_at_quantile(0.99),
            max_us: hist.max(),
        })
    }
}

/// How one thread finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSummary {
    /// Thread name.
    pub name: String,
    /// Completed passes over its operation list.
    pub passes: u64,
    /// Error that ended the thread, if any.
    pub error: Option<String>,
}

/// Everything a finished run measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    /// Counters summed over every table.
    pub totals: TableStats,
    /// Per-table counters, in table registration order.
    pub tables: Vec<(String, TableStats)>,
    /// Interval reports, in order.
    pub intervals: Vec<IntervalReport>,
    /// Counters accumulated after the last interval report.
    pub tail: TableStats,
    /// Transaction outcomes over every thread.
    pub txns: TxnCounts,
    /// Engine call latency, when tracking was enabled.
    pub latency: Option<LatencySummary>,
    /// Per-thread outcome.
    pub threads: Vec<ThreadSummary>,
}

impl RunSummary {
    /// Returns the counters of one table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableStats> {
        self.tables.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Returns the sum of every interval delta plus the tail.
    #[must_use]
    pub fn interval_sum(&self) -> TableStats {
        let mut sum = self.tail;
        for report in &self.intervals {
            sum.add(&report.total);
        }
        sum
    }
}

/// Writes reports to an output stream and mirrors them as tracing events.
pub struct Reporter<'w> {
    out: &'w mut dyn Write,
}

impl<'w> Reporter<'w> {
    /// Creates a reporter writing to `out`.
    pub fn new(out: &'w mut dyn Write) -> Self {
        Self { out }
    }

    fn line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{line}") {
            warn!(error = %e, "report write failed");
        }
    }

    /// Prints the startup banner with the configured action counts.
    pub fn banner(&mut self, threads: usize, configured: &TableStats) {
        info!(threads, "starting workload");
        self.line(&format!(
            "Starting workload: {threads} threads, {}",
            configured.report()
        ));
    }

    /// Prints one interval report.
    pub fn interval(&mut self, report: &IntervalReport) {
        let secs = report.at.as_secs();
        for (name, stats) in &report.tables {
            self.line(&format!("{secs}: {name}: {}", stats.rates(report.interval)));
        }
        info!(
            at_secs = secs,
            ops = report.total.total_ops(),
            failed_reads = report.total.failed_reads,
            "interval report"
        );
        self.line(&format!(
            "{} in {} secs ({secs} total secs)",
            report.total.report(),
            report.interval.as_secs()
        ));
    }

    /// Prints the end-of-run summary.
    pub fn summary(&mut self, summary: &RunSummary) {
        for line in summary.totals.final_report(summary.elapsed) {
            self.line(&line);
        }
        if summary.totals.failed_reads > 0 {
            self.line(&format!(
                "Failed reads: {} (key not found)",
                summary.totals.failed_reads
            ));
        }
        for (name, stats) in &summary.tables {
            self.line(&format!("{name}: {}", stats.report()));
        }
        if summary.txns != TxnCounts::default() {
            self.line(&format!(
                "Transactions: {} committed, {} rolled back",
                summary.txns.commits, summary.txns.rollbacks
            ));
        }
        if let Some(lat) = &summary.latency {
            self.line(&format!(
                "Latency: p50={}us p95={}us p99={}us max={}us ({} calls)",
                lat.p50_us, lat.p95_us, lat.p99_us, lat.max_us, lat.count
            ));
        }
        for thread in &summary.threads {
            if let Some(error) = &thread.error {
                self.line(&format!("{} failed after {} passes: {error}", thread.name, thread.passes));
            }
        }
        info!(
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            ops = summary.totals.total_ops(),
            "run completed"
        );
        self.line(&format!(
            "Run completed: {:.3} seconds",
            summary.elapsed.as_secs_f64()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(inserts: u64, reads: u64) -> TableStats {
        TableStats {
            inserts,
            reads,
            ..TableStats::default()
        }
    }

    fn summary() -> RunSummary {
        RunSummary {
            elapsed: Duration::from_secs(2),
            totals: stats(30, 10),
            tables: vec![("table:a".to_string(), stats(30, 10))],
            intervals: vec![IntervalReport {
                at: Duration::from_secs(1),
                interval: Duration::from_secs(1),
                tables: vec![("table:a".to_string(), stats(20, 4))],
                total: stats(20, 4),
            }],
            tail: stats(10, 6),
            txns: TxnCounts::default(),
            latency: None,
            threads: Vec::new(),
        }
    }

    #[test]
    fn test_interval_sum_matches_totals() {
        let s = summary();
        assert_eq!(s.interval_sum(), s.totals);
        assert_eq!(s.table("table:a"), Some(&stats(30, 10)));
        assert!(s.table("table:b").is_none());
    }

    #[test]
    fn test_interval_lines() {
        let s = summary();
        let mut out = Vec::new();
        Reporter::new(&mut out).interval(&s.intervals[0]);
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "1: table:a: inserts=20 reads=4 failed_reads=0 updates=0 removes=0 truncates=0"
        );
        assert_eq!(
            lines[1],
            "4 reads, 20 inserts, 0 updates, 0 truncates, 0 removes in 1 secs (1 total secs)"
        );
    }

    #[test]
    fn test_summary_lines() {
        let mut out = Vec::new();
        Reporter::new(&mut out).summary(&summary());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Executed 30 insert operations (75%) 15 ops/sec"));
        assert!(text.contains("table:a: 10 reads, 30 inserts"));
        assert!(text.ends_with("Run completed: 2.000 seconds\n"));
        assert!(!text.contains("Transactions:"));
    }

    #[test]
    fn test_snapshot_since() {
        let earlier = Snapshot {
            tables: vec![("t".to_string(), stats(1, 1))],
            total: stats(1, 1),
        };
        let later = Snapshot {
            tables: vec![("t".to_string(), stats(5, 2))],
            total: stats(5, 2),
        };
        let delta = later.since(&earlier);
        assert_eq!(delta.total, stats(4, 1));
        assert_eq!(delta.tables[0].1, stats(4, 1));
    }

    #[test]
    fn test_latency_summary() {
        let mut hist = Histogram::<u64>::new(3).unwrap();
        assert!(LatencySummary::from_histogram(&hist).is_none());
        for v in 1..=100 {
            hist.record(v).unwrap();
        }
        let lat = LatencySummary::from_histogram(&hist).unwrap();
        assert_eq!(lat.count, 100);
        assert_eq!(lat.max_us, 100);
        assert!(lat.p50_us >= 49 && lat.p50_us <= 51);
    }
}
