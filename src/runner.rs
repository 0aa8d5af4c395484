//! Runs task steps on a pool of worker threads.
//! Unaware of the dependency graph; the engine hands over a task with its
//! inputs and later collects it back from `wait()`.

use crate::key::{Key, KeyId};
use crate::rule::{CancelToken, DepKind, Step, Task, TaskContext};
use crate::value::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::time::Instant;

pub struct FinishedStep {
    /// A (faked) "thread id", used to put different steps in different
    /// tracks in a performance trace.
    pub tid: usize,
    pub id: KeyId,
    pub span: (Instant, Instant),
    /// The task, handed back so it can be resumed.
    pub task: Box<dyn Task>,
    /// The step's outcome; errors and panics are flattened to a message.
    pub result: Result<Step, String>,
    /// Keys requested during the step.
    pub requests: Vec<(Key, DepKind)>,
}

/// Tracks faked "thread ids" -- integers assigned to running steps to track
/// parallelism in perf trace output.
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}
impl ThreadIds {
    fn new() -> Self {
        ThreadIds { slots: Vec::new() }
    }

    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", s)
    } else {
        "task panicked".to_string()
    }
}

pub struct Runner {
    pool: rayon::ThreadPool,
    finished_send: mpsc::Sender<FinishedStep>,
    finished_recv: mpsc::Receiver<FinishedStep>,
    running: usize,
    tids: ThreadIds,
    parallelism: usize,
}

impl Runner {
    pub fn new(parallelism: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let parallelism = parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("buildcore-worker-{}", i))
            .build()?;
        let (tx, rx) = mpsc::channel();
        Ok(Runner {
            pool,
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::new(),
            parallelism,
        })
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn start(
        &mut self,
        id: KeyId,
        key: Key,
        mut task: Box<dyn Task>,
        inputs: Vec<(Key, Value)>,
        cancel: CancelToken,
    ) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        self.pool.spawn(move || {
            let start = Instant::now();
            let mut cx = TaskContext::new(key, inputs, cancel);
            let result = match panic::catch_unwind(AssertUnwindSafe(|| task.run(&mut cx))) {
                Ok(Ok(step)) => Ok(step),
                Ok(Err(err)) => Err(format!("{:#}", err)),
                Err(payload) => Err(panic_message(payload)),
            };
            let finish = Instant::now();

            let step = FinishedStep {
                tid,
                id,
                span: (start, finish),
                task,
                result,
                requests: cx.into_requests(),
            };
            // The send will only fail if the receiver disappeared, e.g. due to shutting down.
            let _ = tx.send(step);
        });
        self.running += 1;
    }

    /// Wait for a step to finish.  Returns None if nothing is running.
    pub fn wait(&mut self) -> Option<FinishedStep> {
        if self.running == 0 {
            return None;
        }
        // We hold a sender ourselves, so recv() only fails if that invariant
        // is broken.
        let step = self.finished_recv.recv().ok()?;
        self.tids.release(step.tid);
        self.running -= 1;
        Some(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;
    impl Task for Echo {
        fn run(&mut self, cx: &mut TaskContext) -> anyhow::Result<Step> {
            if cx.key().as_str() == Some("boom") {
                panic!("kaboom");
            }
            Ok(Step::Complete(Value::new(cx.key().as_bytes())))
        }
    }

    #[test]
    fn runs_and_catches_panics() -> anyhow::Result<()> {
        let mut runner = Runner::new(2)?;
        runner.start(KeyId::from(0), Key::from("ok"), Box::new(Echo), Vec::new(), CancelToken::new());
        runner.start(KeyId::from(1), Key::from("boom"), Box::new(Echo), Vec::new(), CancelToken::new());
        assert!(!runner.can_start_more());

        let mut results = Vec::new();
        while let Some(step) = runner.wait() {
            results.push((step.id, step.result));
        }
        results.sort_by_key(|(id, _)| format!("{:?}", id));
        match &results[0].1 {
            Ok(Step::Complete(v)) => assert_eq!(v.as_str(), Some("ok")),
            other => panic!("unexpected {:?}", other),
        }
        match &results[1].1 {
            Err(msg) => assert_eq!(msg, "task panicked: kaboom"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!runner.is_running());
        Ok(())
    }
}
