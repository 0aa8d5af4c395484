//! Per-key build state: the dependency graph as discovered during a build.
//!
//! Edges are plain KeyIds.  A key's `pending` list holds the keys it is
//! currently waiting on and `waiters` the keys waiting on it; both only
//! describe the current epoch and are cleared as soon as the wait ends.

use crate::db::Record;
use crate::error::Failure;
use crate::key::KeyId;
use crate::rule::{DepKind, Rule, Task};
use crate::value::Value;
use std::sync::Arc;

/// Lifecycle of a key within one build.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// Not looked at in this build.
    Unvisited,
    /// Being resolved: checking the prior record against current inputs.
    Requested,
    /// The task is suspended until the keys it requested are done.
    WaitingOnInputs,
    /// The task may run its next step; queued for a worker.
    Ready,
    /// A task step is executing on a worker.
    Running,
    Complete,
    Failed,
}

impl KeyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, KeyState::Complete | KeyState::Failed)
    }
}

const STATE_COUNT: usize = 7;

/// Number of keys in each state, for progress display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts([usize; STATE_COUNT]);

impl StateCounts {
    pub fn get(&self, state: KeyState) -> usize {
        self.0[state as usize]
    }

    pub(crate) fn transition(&mut self, from: KeyState, to: KeyState) {
        if from != KeyState::Unvisited {
            self.0[from as usize] -= 1;
        }
        self.0[to as usize] += 1;
    }

    /// Keys visited in this build that have not finished.
    pub fn in_progress(&self) -> usize {
        self.get(KeyState::Requested)
            + self.get(KeyState::WaitingOnInputs)
            + self.get(KeyState::Ready)
            + self.get(KeyState::Running)
    }
}

/// Everything the engine tracks for one key.
pub(crate) struct Entry {
    pub state: KeyState,
    /// The epoch the fields below describe.  An entry from an older epoch is
    /// treated as Unvisited.
    pub epoch: u64,
    /// The last successful build's record, from the database or from an
    /// earlier build by this engine.
    pub prior: Option<Record>,
    pub result: Option<Result<Value, Failure>>,
    pub rule: Option<Arc<dyn Rule>>,
    /// Index of the next recorded dependency to check while Requested.
    pub scan: usize,
    /// The task, when it exists and is not out on a worker.
    pub task: Option<Box<dyn Task>>,
    /// Keys the task requested so far, in order.
    pub deps: Vec<(KeyId, DepKind)>,
    pub pending: Vec<KeyId>,
    pub waiters: Vec<KeyId>,
}

impl Default for Entry {
    fn default() -> Self {
        Entry {
            state: KeyState::Unvisited,
            epoch: 0,
            prior: None,
            result: None,
            rule: None,
            scan: 0,
            task: None,
            deps: Vec::new(),
            pending: Vec::new(),
            waiters: Vec::new(),
        }
    }
}

impl Entry {
    /// Start tracking this key in a new epoch, keeping only the prior record.
    pub fn visit(&mut self, epoch: u64) {
        self.state = KeyState::Unvisited;
        self.epoch = epoch;
        self.result = None;
        self.rule = None;
        self.scan = 0;
        self.task = None;
        self.deps.clear();
        self.pending.clear();
        self.waiters.clear();
    }

    pub fn value(&self) -> Option<&Value> {
        match &self.result {
            Some(Ok(value)) => Some(value),
            _ => None,
        }
    }
}
