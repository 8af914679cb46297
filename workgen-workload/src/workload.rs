//! Workload orchestration.
//!
//! A [`Workload`] owns a [`Context`] and a set of [`Thread`]s. Running it
//! creates the tables, gives every thread its own session and cursors, starts
//! one OS thread per workload thread, prints interval reports while the run
//! clock ticks, stops everything when `run_time` elapses, and prints the final
//! summary after all handles are closed.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use tracing::{debug, info, warn};
use workgen_engine::{Connection, EngineError};

use crate::context::Context;
use crate::environment::{TableIntent, ThreadEnvironment, TxnCounts};
use crate::error::{ConfigError, WorkgenError, WorkgenResult};
use crate::report::{
    IntervalReport, LatencySummary, Reporter, RunSummary, StatsRegistry, ThreadSummary,
};
use crate::table::TableStats;
use crate::thread::Thread;

/// Table configuration used when a table has none of its own.
pub const DEFAULT_TABLE_CONFIG: &str = "key_format=S,value_format=S";

/// Run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// Run duration in seconds. Zero means every thread runs its count once.
    pub run_time: u64,
    /// Seconds between interval reports. Zero disables them.
    pub report_interval: u64,
    /// Seed for the per-thread random generators.
    pub seed: u64,
    /// Record the latency of every engine call.
    pub track_latency: bool,
    /// Check the value returned by every search.
    pub validate_reads: bool,
    /// Configuration passed to `create_table` for tables without their own.
    pub table_config: String,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            run_time: 0,
            report_interval: 0,
            seed: 0,
            track_latency: false,
            validate_reads: false,
            table_config: DEFAULT_TABLE_CONFIG.to_string(),
        }
    }
}

/// Builder for creating workloads.
#[derive(Debug, Default)]
pub struct WorkloadBuilder {
    context: Option<Context>,
    threads: Vec<Thread>,
    config: WorkloadConfig,
    intents: HashMap<String, TableIntent>,
    table_configs: HashMap<String, String>,
}

impl WorkloadBuilder {
    /// Creates a new workload builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an existing context, continuing its record numbers.
    #[must_use]
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Adds one thread.
    #[must_use]
    pub fn thread(mut self, thread: Thread) -> Self {
        self.threads.push(thread);
        self
    }

    /// Adds `instances` copies of a thread.
    #[must_use]
    pub fn threads(mut self, thread: &Thread, instances: usize) -> Self {
        self.threads
            .extend(std::iter::repeat_with(|| thread.clone()).take(instances));
        self
    }

    /// Sets the run duration in seconds.
    #[must_use]
    pub const fn run_time(mut self, secs: u64) -> Self {
        self.config.run_time = secs;
        self
    }

    /// Sets the report interval in seconds.
    #[must_use]
    pub const fn report_interval(mut self, secs: u64) -> Self {
        self.config.report_interval = secs;
        self
    }

    /// Sets the random seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Enables latency tracking.
    #[must_use]
    pub const fn track_latency(mut self, enabled: bool) -> Self {
        self.config.track_latency = enabled;
        self
    }

    /// Enables search value validation.
    #[must_use]
    pub const fn validate_reads(mut self, enabled: bool) -> Self {
        self.config.validate_reads = enabled;
        self
    }

    /// Declares how a table is expected to be used.
    #[must_use]
    pub fn intent(mut self, table: impl Into<String>, intent: TableIntent) -> Self {
        self.intents.insert(table.into(), intent);
        self
    }

    /// Sets the `create_table` configuration of one table.
    #[must_use]
    pub fn table_config(mut self, table: impl Into<String>, config: impl Into<String>) -> Self {
        self.table_configs.insert(table.into(), config.into());
        self
    }

    /// Builds the workload.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoThreads`] if no thread was added.
    pub fn build(self) -> Result<Workload, ConfigError> {
        if self.threads.is_empty() {
            return Err(ConfigError::NoThreads);
        }
        let mut workload = Workload::new(self.context.unwrap_or_default(), self.threads);
        workload.config = self.config;
        workload.intents = self.intents;
        workload.table_configs = self.table_configs;
        Ok(workload)
    }
}

/// Wakes the orchestrator when a thread fails.
#[derive(Debug, Default)]
struct RunSignal {
    failed: Mutex<Option<usize>>,
    cond: Condvar,
}

impl RunSignal {
    fn fail(&self, index: usize) {
        let mut failed = self.failed.lock().expect("run signal lock poisoned");
        failed.get_or_insert(index);
        self.cond.notify_all();
    }

    /// Waits until `deadline` or a failure. Returns true on failure.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut failed = self.failed.lock().expect("run signal lock poisoned");
        loop {
            if failed.is_some() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(failed, deadline - now)
                .expect("run signal lock poisoned");
            failed = guard;
        }
    }

    fn first_failure(&self) -> Option<usize> {
        *self.failed.lock().expect("run signal lock poisoned")
    }
}

/// A set of threads driving a storage engine for a bounded time.
#[derive(Debug)]
pub struct Workload {
    context: Context,
    threads: Vec<Thread>,
    config: WorkloadConfig,
    intents: HashMap<String, TableIntent>,
    table_configs: HashMap<String, String>,
    last_summary: Option<RunSummary>,
}

impl Workload {
    /// Creates a workload with default settings.
    #[must_use]
    pub fn new(context: Context, threads: Vec<Thread>) -> Self {
        Self {
            context,
            threads,
            config: WorkloadConfig::default(),
            intents: HashMap::new(),
            table_configs: HashMap::new(),
            last_summary: None,
        }
    }

    /// Creates a workload builder.
    #[must_use]
    pub fn builder() -> WorkloadBuilder {
        WorkloadBuilder::new()
    }

    /// Returns the context.
    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Consumes the workload, returning its context for a follow-up run.
    #[must_use]
    pub fn into_context(self) -> Context {
        self.context
    }

    /// Returns the threads.
    #[must_use]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// Returns the run settings.
    #[must_use]
    pub const fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// Returns the run settings for modification.
    pub fn config_mut(&mut self) -> &mut WorkloadConfig {
        &mut self.config
    }

    /// Declares how a table is expected to be used.
    pub fn set_intent(&mut self, table: impl Into<String>, intent: TableIntent) {
        self.intents.insert(table.into(), intent);
    }

    /// Returns the summary of the last run, including a failed one.
    #[must_use]
    pub const fn last_summary(&self) -> Option<&RunSummary> {
        self.last_summary.as_ref()
    }

    /// Returns the current counters summed over every table.
    #[must_use]
    pub fn stats(&self) -> TableStats {
        StatsRegistry::collect(&self.context, &self.threads)
            .snapshot()
            .total
    }

    /// Resets the counters of every table.
    pub fn clear_stats(&self) {
        StatsRegistry::collect(&self.context, &self.threads).clear();
    }

    /// Runs the workload, printing reports to standard output.
    ///
    /// # Errors
    ///
    /// See [`Workload::run_with_output`].
    pub fn run(&mut self, conn: &dyn Connection) -> WorkgenResult<RunSummary> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.run_with_output(conn, &mut out)
    }

    /// Runs the workload, printing reports to `out`.
    ///
    /// When a thread fails the run is cut short and the partial statistics
    /// are still reported and kept in [`Workload::last_summary`].
    ///
    /// # Errors
    ///
    /// Returns a [`WorkgenError::Config`] if the workload is invalid,
    /// [`WorkgenError::Engine`] if setup or teardown fails, and
    /// [`WorkgenError::ThreadFailed`] with the first thread error otherwise.
    pub fn run_with_output(
        &mut self,
        conn: &dyn Connection,
        out: &mut dyn Write,
    ) -> WorkgenResult<RunSummary> {
        self.last_summary = None;
        self.prepare()?;

        let registry = StatsRegistry::collect(&self.context, &self.threads);
        let mut envs = self.create_all(conn)?;
        if let Err(e) = Self::open_all(&mut envs) {
            let _ = Self::close_all(&mut envs);
            return Err(e);
        }

        let mut reporter = Reporter::new(out);
        let (summary, failure) = self.run_all(&mut envs, &registry, &mut reporter);
        let closed = Self::close_all(&mut envs);
        reporter.summary(&summary);
        let checked = ThreadEnvironment::cross_check(&envs, &self.context, &self.intents);
        drop(envs);

        self.last_summary = Some(summary.clone());
        if let Some(e) = failure {
            return Err(e);
        }
        closed?;
        checked?;
        Ok(summary)
    }

    /// Names unnamed threads and binds every table to the context.
    fn prepare(&mut self) -> Result<(), ConfigError> {
        if self.threads.is_empty() {
            return Err(ConfigError::NoThreads);
        }
        for (index, thread) in self.threads.iter_mut().enumerate() {
            thread.set_default_name(index);
            if thread.repeats() && self.config.run_time == 0 {
                return Err(ConfigError::UnboundedThread {
                    thread: thread.name().to_string(),
                });
            }
            for op in thread.ops_mut() {
                op.create_all(&mut self.context, false)?;
            }
        }
        Ok(())
    }

    /// Creates the tables and one environment with an open session per thread.
    fn create_all(&self, conn: &dyn Connection) -> WorkgenResult<Vec<ThreadEnvironment<'_>>> {
        for name in self.context.table_names() {
            let config = self
                .table_configs
                .get(name)
                .unwrap_or(&self.config.table_config);
            conn.create_table(name, config)
                .map_err(|e| WorkgenError::engine("create_table", e))?;
        }

        let mut envs = Vec::with_capacity(self.threads.len());
        for (index, thread) in self.threads.iter().enumerate() {
            let mut env = ThreadEnvironment::new(&self.context, thread, index, self.config.seed)
                .with_latency_tracking(self.config.track_latency)
                .with_read_validation(self.config.validate_reads);
            if let Err(e) = env.create(conn) {
                let _ = Self::close_all(&mut envs);
                return Err(e);
            }
            envs.push(env);
        }
        debug!(threads = envs.len(), tables = self.context.table_count(), "created environments");
        Ok(envs)
    }

    fn open_all(envs: &mut [ThreadEnvironment<'_>]) -> WorkgenResult<()> {
        for env in envs {
            env.open()?;
        }
        Ok(())
    }

    /// Closes every environment, returning the first error.
    fn close_all(envs: &mut [ThreadEnvironment<'_>]) -> WorkgenResult<()> {
        let mut first = None;
        for env in envs {
            if let Err(e) = env.close() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    #[allow(clippy::too_many_lines)]
    fn run_all(
        &self,
        envs: &mut [ThreadEnvironment<'_>],
        registry: &StatsRegistry,
        reporter: &mut Reporter<'_>,
    ) -> (RunSummary, Option<WorkgenError>) {
        let mut configured = TableStats::default();
        for thread in &self.threads {
            thread.static_counts(&mut configured);
        }
        reporter.banner(self.threads.len(), &configured);

        registry.clear();
        let run_time = Duration::from_secs(self.config.run_time);
        let interval = Duration::from_secs(self.config.report_interval);
        let timed = !run_time.is_zero();
        let signal = RunSignal::default();
        let mut intervals = Vec::new();
        let mut last = registry.snapshot();
        let start = Instant::now();

        let spawn_error = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(envs.len());
            let mut spawn_error = None;
            for (index, (thread, env)) in self.threads.iter().zip(envs.iter_mut()).enumerate() {
                thread.reset_stop();
                env.set_repeat(timed);
                let signal = &signal;
                let spawned = std::thread::Builder::new()
                    .name(thread.name().to_string())
                    .spawn_scoped(scope, move || {
                        if thread.run(env).is_err() {
                            signal.fail(index);
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        warn!(thread = %thread.name(), error = %e, "failed to spawn thread");
                        spawn_error = Some(WorkgenError::engine(
                            "spawn_thread",
                            EngineError::io("spawn thread", e),
                        ));
                        break;
                    }
                }
            }

            if timed && spawn_error.is_none() {
                let end = start + run_time;
                let mut next_report = start + interval;
                let mut last_at = start;
                loop {
                    if Instant::now() >= end {
                        break;
                    }
                    let wake = if interval.is_zero() {
                        end
                    } else {
                        next_report.min(end)
                    };
                    if signal.wait_until(wake) {
                        info!("thread failure, stopping run early");
                        break;
                    }
                    let now = Instant::now();
                    if !interval.is_zero() && now >= next_report && now < end {
                        let snapshot = registry.snapshot();
                        let delta = snapshot.since(&last);
                        let report = IntervalReport {
                            at: now.duration_since(start),
                            interval: now.duration_since(last_at),
                            tables: delta.tables,
                            total: delta.total,
                        };
                        reporter.interval(&report);
                        intervals.push(report);
                        last = snapshot;
                        last_at = now;
                        while next_report <= now {
                            next_report += interval;
                        }
                    }
                }
            }

            for thread in &self.threads {
                thread.stop();
            }
            for handle in handles {
                if let Err(panic) = handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
            spawn_error
        });
        let elapsed = start.elapsed();

        let snapshot = registry.snapshot();
        let tail = snapshot.total.since(&last.total);
        let mut txns = TxnCounts::default();
        let mut merged: Option<Histogram<u64>> = None;
        let mut threads = Vec::with_capacity(envs.len());
        for env in envs.iter() {
            txns.add(&env.txn_counts());
            if let Some(hist) = env.latency() {
                match merged.as_mut() {
                    Some(m) => {
                        let _ = m.add(hist);
                    }
                    None => merged = Some(hist.clone()),
                }
            }
            threads.push(ThreadSummary {
                name: env.thread().name().to_string(),
                passes: env.passes(),
                error: env.error().map(ToString::to_string),
            });
        }

        let failure = spawn_error.or_else(|| {
            let index = signal
                .first_failure()
                .or_else(|| envs.iter().position(|env| env.error().is_some()))?;
            let env = &envs[index];
            env.error().map(|e| WorkgenError::ThreadFailed {
                thread: env.thread().name().to_string(),
                source: Box::new(e.clone()),
            })
        });

        let summary = RunSummary {
            elapsed,
            totals: snapshot.total,
            tables: snapshot.tables,
            intervals,
            tail,
            txns,
            latency: merged.as_ref().and_then(LatencySummary::from_histogram),
            threads,
        };
        (summary, failure)
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Workload: {} threads, run_time {}, report_interval {}",
            self.threads.len(),
            self.config.run_time,
            self.config.report_interval
        )?;
        for thread in &self.threads {
            write!(f, "\n{thread}")?;
        }
        Ok(())
    }
}
