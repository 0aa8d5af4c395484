//! Build progress tracking and reporting, for the purpose of display to the
//! user.  All calls come from the engine's coordinating thread.

use crate::error::Failure;
use crate::graph::StateCounts;
use crate::key::Key;
use crate::value::Value;
use std::io::Write;

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as keys progress through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a task step is handed to a worker.
    fn task_started(&mut self, key: &Key);

    /// Called when a task has produced its final result.
    fn task_finished(&mut self, key: &Key, result: &Result<Value, Failure>);

    /// Called for each failure that originates at key (not for keys that
    /// merely depend on a failed input).
    fn failed(&mut self, key: &Key, failure: &Failure);

    /// Called once when a build ends.
    fn finish(&mut self);
}

/// Progress implementation that reports nothing.
#[derive(Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _key: &Key) {}
    fn task_finished(&mut self, _key: &Key, _result: &Result<Value, Failure>) {}
    fn failed(&mut self, _key: &Key, _failure: &Failure) {}
    fn finish(&mut self) {}
}

/// Progress implementation for a "dumb" console, without any overprinting.
pub struct DumbConsoleProgress<W: Write> {
    out: W,
    /// Whether to print every task step as it starts.
    verbose: bool,
    /// Tasks that finished, for the summary line.
    finished: usize,
    failed: usize,
}

impl DumbConsoleProgress<std::io::Stdout> {
    pub fn new(verbose: bool) -> Self {
        Self::with_writer(std::io::stdout(), verbose)
    }
}

impl<W: Write> DumbConsoleProgress<W> {
    pub fn with_writer(out: W, verbose: bool) -> Self {
        DumbConsoleProgress {
            out,
            verbose,
            finished: 0,
            failed: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn log(&mut self, msg: &str) {
        // Console output is advisory; a closed stdout must not fail the build.
        let _ = writeln!(self.out, "{}", msg);
    }
}

impl<W: Write> Progress for DumbConsoleProgress<W> {
    fn update(&mut self, _counts: &StateCounts) {
        // ignore
    }

    fn task_started(&mut self, key: &Key) {
        if self.verbose {
            self.log(&format!("run {}", key));
        }
    }

    fn task_finished(&mut self, _key: &Key, result: &Result<Value, Failure>) {
        if result.is_ok() {
            self.finished += 1;
        }
    }

    fn failed(&mut self, key: &Key, failure: &Failure) {
        self.failed += 1;
        self.log(&format!("failed: {}: {}", key, failure));
    }

    fn finish(&mut self) {
        match (self.finished, self.failed) {
            (0, 0) => self.log("no work to do"),
            (n, 0) => self.log(&format!("ran {} tasks, now up to date", n)),
            (n, f) => self.log(&format!("ran {} tasks, {} failed", n, f)),
        }
        self.finished = 0;
        self.failed = 0;
    }
}
