//! The build engine: decides what is out of date, drives tasks through their
//! steps, and records results.
//!
//! All graph state lives here and is only touched by the thread calling
//! `build()`.  Workers run task steps and hand the task back through the
//! runner; the engine then applies the resulting state transitions.  That
//! single-writer discipline is what lets tasks request inputs at any time
//! without locking.

use crate::db::{Database, Dependency, Record};
use crate::densemap::DenseMap;
use crate::error::{Error, Failure};
use crate::graph::{Entry, KeyState, StateCounts};
use crate::key::{Key, KeyId, KeyTable};
use crate::progress::{NoProgress, Progress};
use crate::rule::{CancelToken, DepKind, Rules, Step};
use crate::runner::{FinishedStep, Runner};
use crate::trace::Trace;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of task steps that may run at once.
    pub workers: usize,
    /// Stop starting new tasks after this many failures; 0 means never stop
    /// and collect every failure.
    pub keep_going: usize,
    /// fsync the database after every record.
    pub sync_writes: bool,
    /// Compact the database on attach when superseded records outnumber
    /// live ones by this factor.
    pub compact_ratio: f64,
    /// Write a Chrome trace of all task steps here.
    pub trace_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            keep_going: 0,
            sync_writes: false,
            compact_ratio: 4.0,
            trace_path: None,
        }
    }
}

impl Config {
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn keep_going(mut self, n: usize) -> Self {
        self.keep_going = n;
        self
    }

    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    pub fn compact_ratio(mut self, ratio: f64) -> Self {
        self.compact_ratio = ratio;
        self
    }

    pub fn trace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_path = Some(path.into());
        self
    }
}

/// A failure that originated at a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub key: Key,
    pub failure: Failure,
}

/// The outcome of one `build()` call.
#[derive(Debug)]
pub struct BuildReport {
    /// One result per requested root, in request order.
    pub results: Vec<(Key, Result<Value, Failure>)>,
    /// Every failure that originated somewhere in the build.
    pub diagnostics: Vec<Diagnostic>,
    /// Tasks that ran to completion.
    pub executed: usize,
    /// Keys whose prior value was reused without running anything.
    pub cached: usize,
    /// Tasks that ran but produced an unchanged signature.
    pub cutoffs: usize,
    pub epoch: u64,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    pub fn result(&self, key: &Key) -> Option<&Result<Value, Failure>> {
        self.results.iter().find(|(k, _)| k == key).map(|(_, r)| r)
    }

    pub fn value(&self, key: &Key) -> Option<&Value> {
        self.result(key).and_then(|r| r.as_ref().ok())
    }
}

enum Event {
    Resolve(KeyId),
    /// input reached a terminal state and waiter was waiting on it.
    Notify { waiter: KeyId, input: KeyId },
}

/// State for a single build.
#[derive(Default)]
struct Work {
    events: VecDeque<Event>,
    ready: VecDeque<KeyId>,
    visited: Vec<KeyId>,
    counts: StateCounts,
    diagnostics: Vec<Diagnostic>,
    executed: usize,
    cached: usize,
    cutoffs: usize,
    stopping: bool,
}

pub struct Engine {
    rules: Rules,
    config: Config,
    keys: KeyTable,
    entries: DenseMap<KeyId, Entry>,
    db: Option<Database>,
    epoch: u64,
    runner: Runner,
    progress: Box<dyn Progress>,
    cancel: CancelToken,
    trace: Option<Trace>,
    work: Work,
}

impl Engine {
    pub fn new(rules: Rules, config: Config) -> Result<Engine, Error> {
        let runner = Runner::new(config.workers)?;
        let trace = match &config.trace_path {
            Some(path) => Some(Trace::open(path)?),
            None => None,
        };
        Ok(Engine {
            rules,
            config,
            keys: KeyTable::default(),
            entries: DenseMap::default(),
            db: None,
            epoch: 0,
            runner,
            progress: Box::new(NoProgress),
            cancel: CancelToken::new(),
            trace,
            work: Work::default(),
        })
    }

    /// Use the database at path for prior results, creating it if needed.
    /// A database from an incompatible version or a damaged one is
    /// discarded, which makes the next build start from scratch.
    pub fn attach_db(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let db_error = |source| Error::Db {
            path: path.display().to_string(),
            source,
        };
        let mut db = match Database::open(path) {
            Ok(db) => db,
            Err(err) if err.needs_reset() => {
                warn!(path = %path.display(), "discarding build database: {}", err);
                Database::create(path).map_err(db_error)?
            }
            Err(err) => return Err(db_error(err)),
        };
        db.set_sync_writes(self.config.sync_writes);
        if db.garbage_ratio() > self.config.compact_ratio {
            db.compact().map_err(db_error)?;
        }

        for (key, record) in db.records() {
            let id = self.keys.intern(key);
            self.entries.get_grow(id).prior = Some(record.clone());
        }
        self.epoch = self.epoch.max(db.epoch());
        info!(path = %path.display(), records = db.len(), epoch = db.epoch(), "attached build database");
        self.db = Some(db);
        Ok(())
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    pub fn set_progress(&mut self, progress: Box<dyn Progress>) {
        self.progress = progress;
    }

    /// Use token for cancelling builds.  The token is reset when a build
    /// starts.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The epoch of the latest build.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Build a single key.
    pub fn build_key(&mut self, key: impl Into<Key>) -> Result<Value, Failure> {
        let key = key.into();
        let report = self.build(std::slice::from_ref(&key));
        match report.results.into_iter().next() {
            Some((_, result)) => result,
            None => Err(Failure::Cancelled),
        }
    }

    /// Bring roots up to date, running only what is out of date.
    pub fn build(&mut self, roots: &[Key]) -> BuildReport {
        self.epoch += 1;
        let _span = tracing::info_span!("build", epoch = self.epoch).entered();
        if let Some(db) = &mut self.db {
            if let Err(err) = db.set_epoch(self.epoch) {
                warn!("recording epoch: {}", err);
            }
        }
        self.work = Work::default();
        self.cancel.reset();

        let root_ids: Vec<KeyId> = roots.iter().map(|key| self.keys.intern(key)).collect();
        for &id in &root_ids {
            self.want(id);
        }
        self.run();
        self.finish(&root_ids)
    }

    fn state(&self, id: KeyId) -> KeyState {
        match self.entries.lookup(id) {
            Some(entry) if entry.epoch == self.epoch => entry.state,
            _ => KeyState::Unvisited,
        }
    }

    fn set_state(&mut self, id: KeyId, state: KeyState) {
        let entry = &mut self.entries[id];
        let prev = entry.state;
        entry.state = state;
        self.work.counts.transition(prev, state);
    }

    fn key(&self, id: KeyId) -> &Key {
        self.keys.key(id)
    }

    fn value(&self, id: KeyId) -> Option<&Value> {
        self.entries.lookup(id).and_then(|e| e.value())
    }

    /// Start resolving id if this build has not seen it yet.
    fn want(&mut self, id: KeyId) {
        if self.state(id) != KeyState::Unvisited {
            return;
        }
        let epoch = self.epoch;
        self.entries.get_grow(id).visit(epoch);
        self.work.visited.push(id);
        self.set_state(id, KeyState::Requested);
        self.work.events.push_back(Event::Resolve(id));
    }

    fn is_stopping(&mut self) -> bool {
        if crate::signal::take_interrupt() {
            info!("interrupted");
            self.cancel.cancel();
        }
        if !self.work.stopping && self.cancel.is_cancelled() {
            info!("build cancelled");
            self.work.stopping = true;
        }
        self.work.stopping
    }

    fn run(&mut self) {
        loop {
            while let Some(event) = self.work.events.pop_front() {
                match event {
                    Event::Resolve(id) => self.resolve(id),
                    Event::Notify { waiter, input } => self.notify(waiter, input),
                }
            }
            if !self.is_stopping() {
                self.dispatch();
            }
            self.progress.update(&self.work.counts);

            if !self.runner.is_running() {
                break;
            }
            let step = match self.runner.wait() {
                Some(step) => step,
                None => break,
            };
            self.finish_step(step);
        }
    }

    /// Decide whether id's prior result can be reused.
    fn resolve(&mut self, id: KeyId) {
        if self.state(id) != KeyState::Requested || self.entries[id].rule.is_some() {
            return;
        }
        let key = self.key(id).clone();
        let rule = match self.rules.lookup(&key) {
            Some(rule) => rule,
            None => {
                self.fail(id, Failure::RuleNotFound(key));
                return;
            }
        };
        let entry = &mut self.entries[id];
        entry.rule = Some(rule.clone());
        let valid = match &entry.prior {
            None => {
                debug!(key = %key, "no prior result");
                false
            }
            Some(record) => rule.is_result_valid(&key, &record.value),
        };
        if !valid {
            self.start_task(id);
            return;
        }
        self.scan(id);
    }

    /// Walk the recorded inputs of id's prior result in order, stopping at
    /// the first one that is not yet known or that changed.
    fn scan(&mut self, id: KeyId) {
        loop {
            let entry = &self.entries[id];
            let (dep_key, recorded) = match entry
                .prior
                .as_ref()
                .and_then(|record| record.dependencies.get(entry.scan))
            {
                Some(dep) => (dep.key.clone(), dep.signature),
                None => break,
            };
            let dep = self.keys.intern(&dep_key);
            match self.state(dep) {
                KeyState::Complete => {
                    let current = match self.value(dep) {
                        Some(value) => *value.signature(),
                        None => return self.start_task(id),
                    };
                    let entry = &self.entries[id];
                    let unchanged = match &entry.rule {
                        Some(rule) => {
                            rule.is_input_valid(self.keys.key(id), &dep_key, &recorded, &current)
                        }
                        None => false,
                    };
                    if !unchanged {
                        debug!(key = %self.key(id), input = %dep_key, "input changed");
                        self.start_task(id);
                        return;
                    }
                    self.entries[id].scan += 1;
                }
                KeyState::Failed => {
                    debug!(key = %self.key(id), input = %dep_key, "recorded input failed");
                    self.start_task(id);
                    return;
                }
                _ => {
                    self.wait_on(id, dep);
                    return;
                }
            }
        }
        self.complete_cached(id);
    }

    fn complete_cached(&mut self, id: KeyId) {
        let value = match &self.entries[id].prior {
            Some(record) => record.value.clone(),
            None => return self.start_task(id),
        };
        self.entries[id].result = Some(Ok(value));
        self.set_state(id, KeyState::Complete);
        self.work.cached += 1;
        debug!(key = %self.key(id), "up to date");
        self.notify_waiters(id);
    }

    fn start_task(&mut self, id: KeyId) {
        let key = self.keys.key(id).clone();
        let rule = match self.entries[id].rule.clone() {
            Some(rule) => rule,
            None => return self.fail(id, Failure::RuleNotFound(key)),
        };
        let entry = &mut self.entries[id];
        entry.task = Some(rule.create_task(&key));
        entry.deps.clear();
        entry.pending.clear();
        entry.scan = 0;
        debug!(key = %key, "task created");
        self.set_state(id, KeyState::Ready);
        self.work.ready.push_back(id);
    }

    /// Make id wait for dep, unless that would close a cycle.
    fn wait_on(&mut self, id: KeyId, dep: KeyId) {
        self.want(dep);
        if let Some(cycle) = self.find_cycle(id, dep) {
            self.break_cycle(id, dep, cycle);
            return;
        }
        self.entries[dep].waiters.push(id);
        self.entries[id].pending.push(dep);
    }

    /// If dep already (transitively) waits on id, returns the cycle
    /// id -> dep -> ... -> id.
    fn find_cycle(&self, id: KeyId, dep: KeyId) -> Option<Vec<KeyId>> {
        if dep == id {
            return Some(vec![id, id]);
        }
        let mut parent: FxHashMap<KeyId, KeyId> = FxHashMap::default();
        parent.insert(dep, dep);
        let mut stack = vec![dep];
        while let Some(node) = stack.pop() {
            let entry = match self.entries.lookup(node) {
                Some(entry) if entry.epoch == self.epoch => entry,
                _ => continue,
            };
            for &next in &entry.pending {
                if next == id {
                    let mut path = vec![id];
                    let mut back = vec![node];
                    let mut cur = node;
                    while cur != dep {
                        cur = parent[&cur];
                        back.push(cur);
                    }
                    path.extend(back.into_iter().rev());
                    path.push(id);
                    return Some(path);
                }
                if !parent.contains_key(&next) {
                    parent.insert(next, node);
                    stack.push(next);
                }
            }
        }
        None
    }

    fn break_cycle(&mut self, id: KeyId, dep: KeyId, cycle: Vec<KeyId>) {
        let members = &cycle[..cycle.len() - 1];
        // A key still checking its prior record may be waiting on inputs it
        // no longer needs; rerunning it may dissolve the cycle.
        if let Some(&scanning) = members
            .iter()
            .find(|&&k| self.state(k) == KeyState::Requested)
        {
            debug!(key = %self.key(scanning), "cycle through a prior record, running task");
            self.start_task(scanning);
            if scanning != id {
                self.entries[dep].waiters.push(id);
                self.entries[id].pending.push(dep);
            }
            return;
        }

        let keys: Vec<Key> = cycle.iter().map(|&k| self.key(k).clone()).collect();
        warn!("dependency cycle: {}", Failure::Cycle(keys.clone()));
        for &member in members {
            self.fail(member, Failure::Cycle(keys.clone()));
        }
    }

    fn notify_waiters(&mut self, id: KeyId) {
        let waiters = std::mem::take(&mut self.entries[id].waiters);
        for waiter in waiters {
            self.work.events.push_back(Event::Notify { waiter, input: id });
        }
    }

    fn notify(&mut self, waiter: KeyId, input: KeyId) {
        let state = self.state(waiter);
        let entry = &mut self.entries[waiter];
        // Waits that were abandoned leave stale notifications behind.
        let pos = match entry.pending.iter().position(|&p| p == input) {
            Some(pos) => pos,
            None => return,
        };
        entry.pending.swap_remove(pos);
        match state {
            KeyState::Requested => self.scan(waiter),
            KeyState::WaitingOnInputs => {
                if self.state(input) == KeyState::Failed {
                    let input = self.key(input).clone();
                    self.fail(waiter, Failure::Dependency(input));
                } else if self.entries[waiter].pending.is_empty() {
                    self.set_state(waiter, KeyState::Ready);
                    self.work.ready.push_back(waiter);
                }
            }
            _ => {}
        }
    }

    /// Hand ready tasks to workers while there is capacity.
    fn dispatch(&mut self) {
        while self.runner.can_start_more() {
            let id = match self.work.ready.pop_front() {
                Some(id) => id,
                None => break,
            };
            if self.state(id) != KeyState::Ready {
                continue;
            }
            let task = match self.entries[id].task.take() {
                Some(task) => task,
                None => continue,
            };
            let inputs: Vec<(Key, Value)> = self.entries[id]
                .deps
                .iter()
                .filter(|(_, kind)| *kind == DepKind::Input)
                .filter_map(|&(dep, _)| Some((self.key(dep).clone(), self.value(dep)?.clone())))
                .collect();
            let key = self.key(id).clone();
            self.set_state(id, KeyState::Running);
            self.progress.task_started(&key);
            self.runner.start(id, key, task, inputs, self.cancel.clone());
        }
    }

    fn finish_step(&mut self, step: FinishedStep) {
        let FinishedStep {
            tid,
            id,
            span,
            task,
            result,
            requests,
        } = step;
        let key = self.key(id).clone();
        if let Some(trace) = &mut self.trace {
            trace.step(&key.to_string(), tid, span);
        }
        match result {
            Err(msg) => {
                let failure = Failure::Task(msg);
                self.progress.task_finished(&key, &Err(failure.clone()));
                self.fail(id, failure);
            }
            Ok(Step::Complete(value)) => self.commit(id, value),
            Ok(Step::Pending) => {
                self.entries[id].task = Some(task);
                self.set_state(id, KeyState::WaitingOnInputs);
                self.add_requests(id, requests);
            }
        }
    }

    fn add_requests(&mut self, id: KeyId, requests: Vec<(Key, DepKind)>) {
        let mut new = 0;
        for (dep_key, kind) in requests {
            let dep = self.keys.intern(&dep_key);
            let deps = &mut self.entries[id].deps;
            match deps.iter_mut().find(|(d, _)| *d == dep) {
                Some((_, existing)) => {
                    if *existing == DepKind::OrderOnly && kind == DepKind::Input {
                        // Now the value is wanted too.
                        *existing = DepKind::Input;
                        new += 1;
                    }
                    continue;
                }
                None => deps.push((dep, kind)),
            }
            new += 1;
            match self.state(dep) {
                KeyState::Complete => {}
                KeyState::Failed => {
                    self.fail(id, Failure::Dependency(dep_key));
                    return;
                }
                _ => {
                    self.wait_on(id, dep);
                    if self.state(id) != KeyState::WaitingOnInputs {
                        // The request closed a cycle and id failed.
                        return;
                    }
                }
            }
        }
        if new == 0 {
            self.fail(
                id,
                Failure::Task("task is pending but requested no new inputs".to_string()),
            );
            return;
        }
        if self.entries[id].pending.is_empty() {
            self.set_state(id, KeyState::Ready);
            self.work.ready.push_back(id);
        }
    }

    /// Persist a task's value and publish it to waiters.
    fn commit(&mut self, id: KeyId, value: Value) {
        let key = self.key(id).clone();
        let dependencies: Vec<Dependency> = self.entries[id]
            .deps
            .iter()
            .filter(|(_, kind)| *kind == DepKind::Input)
            .filter_map(|&(dep, _)| {
                Some(Dependency {
                    key: self.key(dep).clone(),
                    signature: *self.value(dep)?.signature(),
                })
            })
            .collect();

        let prior = self.entries[id].prior.as_ref();
        let unchanged = prior.map(|r| r.signature() == value.signature()) == Some(true);
        let built_at = match prior {
            Some(record) if unchanged => record.built_at,
            _ => self.epoch,
        };
        if unchanged {
            debug!(key = %key, "reran with unchanged signature");
            self.work.cutoffs += 1;
        }
        let record = Record {
            value: value.clone(),
            dependencies,
            built_at,
            computed_at: self.epoch,
        };

        if let Some(db) = &mut self.db {
            if let Err(err) = db.put(&key, record.clone()) {
                let failure = Failure::Database(err.to_string());
                self.progress.task_finished(&key, &Err(failure.clone()));
                self.fail(id, failure);
                return;
            }
        }

        let entry = &mut self.entries[id];
        entry.prior = Some(record);
        entry.task = None;
        entry.result = Some(Ok(value));
        self.set_state(id, KeyState::Complete);
        self.work.executed += 1;
        debug!(key = %key, "complete");
        if let Some(result) = &self.entries[id].result {
            self.progress.task_finished(&key, result);
        }
        self.notify_waiters(id);
    }

    fn fail(&mut self, id: KeyId, failure: Failure) {
        if self.state(id).is_terminal() {
            return;
        }
        let key = self.key(id).clone();
        let entry = &mut self.entries[id];
        entry.task = None;
        entry.pending.clear();
        entry.result = Some(Err(failure.clone()));
        self.set_state(id, KeyState::Failed);

        match failure {
            Failure::Dependency(_) | Failure::Cancelled => {
                debug!(key = %key, "{}", failure);
            }
            _ => {
                debug!(key = %key, "failed: {}", failure);
                self.progress.failed(&key, &failure);
                self.work.diagnostics.push(Diagnostic { key, failure });
                let limit = self.config.keep_going;
                if limit > 0 && self.work.diagnostics.len() >= limit && !self.work.stopping {
                    info!("stopping after {} failures", self.work.diagnostics.len());
                    self.work.stopping = true;
                }
            }
        }
        self.notify_waiters(id);
    }

    fn finish(&mut self, roots: &[KeyId]) -> BuildReport {
        // Whatever did not finish was cut off by cancellation.
        let visited = std::mem::take(&mut self.work.visited);
        for &id in &visited {
            if !self.state(id).is_terminal() {
                self.fail(id, Failure::Cancelled);
            }
            let entry = &mut self.entries[id];
            entry.pending.clear();
            entry.waiters.clear();
        }
        self.work.events.clear();
        self.work.ready.clear();
        self.progress.update(&self.work.counts);
        self.progress.finish();

        let results = roots
            .iter()
            .map(|&id| {
                let result = match &self.entries[id].result {
                    Some(result) => result.clone(),
                    None => Err(Failure::Cancelled),
                };
                (self.key(id).clone(), result)
            })
            .collect();
        let work = std::mem::take(&mut self.work);
        info!(
            executed = work.executed,
            cached = work.cached,
            cutoffs = work.cutoffs,
            failures = work.diagnostics.len(),
            "build finished"
        );
        BuildReport {
            results,
            diagnostics: work.diagnostics,
            executed: work.executed,
            cached: work.cached,
            cutoffs: work.cutoffs,
            epoch: self.epoch,
        }
    }
}
