//! Workload threads.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::context::RecnoIndex;
use crate::environment::ThreadEnvironment;
use crate::error::WorkgenResult;
use crate::operation::Operation;
use crate::table::TableStats;

/// Lifecycle of a thread's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Environment built; session not yet open.
    Created,
    /// Cursors open.
    Open,
    /// Replaying operations.
    Running,
    /// Finished its last pass.
    Stopping,
    /// Cursors and session released.
    Closed,
}

/// An ordered list of operations replayed by one OS thread.
#[derive(Debug, Clone)]
pub struct Thread {
    ops: Vec<Operation>,
    name: String,
    count: u64,
    repeat: bool,
    stop: Arc<AtomicBool>,
}

impl Thread {
    /// Creates a thread that runs its operations once.
    #[must_use]
    pub fn new(ops: Vec<Operation>) -> Self {
        Self {
            ops,
            name: String::new(),
            count: 1,
            repeat: false,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets how many passes to make in count mode.
    #[must_use]
    pub const fn with_count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replays the operations until stopped instead of counting passes.
    #[must_use]
    pub const fn repeat_until_stopped(mut self) -> Self {
        self.repeat = true;
        self
    }

    /// Returns the operations.
    #[must_use]
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub(crate) fn ops_mut(&mut self) -> &mut [Operation] {
        &mut self.ops
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_default_name(&mut self, index: usize) {
        if self.name.is_empty() {
            self.name = format!("thread{index}");
        }
    }

    /// Returns the count-mode pass count.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Returns true if the thread was built to repeat until stopped.
    #[must_use]
    pub const fn repeats(&self) -> bool {
        self.repeat
    }

    /// Asks the thread to stop at its next pass boundary.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Returns true once [`Thread::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn reset_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    /// Adds the configured actions of every operation into `stats`.
    pub fn static_counts(&self, stats: &mut TableStats) {
        for op in &self.ops {
            op.static_counts(stats);
        }
    }

    /// Returns the distinct tables the operations touch, in first-seen order.
    #[must_use]
    pub fn table_indexes(&self) -> Vec<RecnoIndex> {
        let mut indexes = Vec::new();
        for op in &self.ops {
            op.visit_tables(&mut |table| {
                if let Some(binding) = table.binding() {
                    if !indexes.contains(&binding.recno_index) {
                        indexes.push(binding.recno_index);
                    }
                }
            });
        }
        indexes
    }

    /// Returns the largest key and value sizes used by the operations.
    #[must_use]
    pub fn buffer_sizes(&self) -> (usize, usize) {
        self.ops.iter().fold((0, 0), |(k, v), op| {
            let (ok, ov) = op.buffer_sizes();
            (k.max(ok), v.max(ov))
        })
    }

    /// Runs the thread to completion in the calling OS thread.
    ///
    /// In count mode exactly [`Thread::count`] passes are made and the stop
    /// flag is ignored. In repeat mode passes continue until the stop flag is
    /// seen at a pass boundary. The first error ends the thread and is
    /// recorded on the environment.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the thread.
    pub fn run(&self, env: &mut ThreadEnvironment<'_>) -> WorkgenResult<()> {
        env.set_state(ThreadState::Running);
        let repeat = env.repeat();
        if env.context().verbose() {
            info!(thread = %self.name, repeat, count = self.count, "thread starting");
        }

        let mut passes = 0u64;
        let result = loop {
            if repeat {
                if self.is_stopped() {
                    break Ok(());
                }
            } else if passes >= self.count {
                break Ok(());
            }
            if let Err(e) = self.run_pass(env) {
                break Err(e);
            }
            passes += 1;
        };

        env.set_passes(passes);
        env.set_state(ThreadState::Stopping);
        match result {
            Ok(()) => {
                debug!(thread = %self.name, passes, "thread finished");
                Ok(())
            }
            Err(e) => {
                error!(thread = %self.name, passes, error = %e, "thread failed");
                env.record_error(e.clone());
                Err(e)
            }
        }
    }

    fn run_pass(&self, env: &mut ThreadEnvironment<'_>) -> WorkgenResult<()> {
        for op in &self.ops {
            op.run(env)?;
        }
        Ok(())
    }
}

impl fmt::Display for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread: {}", self.name)?;
        if self.repeat {
            write!(f, ", repeat")?;
        } else {
            write!(f, ", count {}", self.count)?;
        }
        for op in &self.ops {
            write!(f, "\n  {op}")?;
        }
        Ok(())
    }
}
