//! Rules tell the engine how to build keys.
//!
//! A Rule maps a Key to a Task plus the policy deciding whether a cached
//! result is still valid.  A Task is driven by the engine in steps: each
//! step either requests more inputs and returns `Step::Pending`, or
//! completes with a Value.  A pending task is put aside without holding a
//! worker and is run again once everything it requested is available.

use crate::key::Key;
use crate::value::{Signature, Value};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a task step produced.
#[derive(Debug)]
pub enum Step {
    /// The task requested inputs and wants to run again once they are ready.
    Pending,
    Complete(Value),
}

/// How a requested key relates to the requesting task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// The value is delivered to the task and recorded for validity checks.
    Input,
    /// The key must be built first, but its value is neither delivered nor
    /// recorded.
    OrderOnly,
}

/// A stateful, single-use unit of work building one key.
pub trait Task: Send {
    /// Run one step.  Inputs requested in earlier steps are available
    /// through the context.
    fn run(&mut self, cx: &mut TaskContext) -> anyhow::Result<Step>;
}

/// Policy and task factory for a family of keys.
pub trait Rule: Send + Sync {
    fn create_task(&self, key: &Key) -> Box<dyn Task>;

    /// Whether the prior value is still valid as far as state outside the
    /// engine is concerned (files on disk, an "always rebuild" policy, ...).
    /// Checked before any recorded input is looked at.
    fn is_result_valid(&self, _key: &Key, _prior: &Value) -> bool {
        true
    }

    /// Whether a recorded input with signature `recorded` at the time of the
    /// last build is unchanged now that it has signature `current`.
    fn is_input_valid(
        &self,
        _key: &Key,
        _input: &Key,
        recorded: &Signature,
        current: &Signature,
    ) -> bool {
        recorded == current
    }
}

/// Shared flag for aborting a build from another thread.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once cancelled, or while an interrupt is pending that no build
    /// has taken yet.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || crate::signal::was_interrupted()
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The view a task step has of the engine.
pub struct TaskContext {
    key: Key,
    inputs: Vec<(Key, Value)>,
    requests: Vec<(Key, DepKind)>,
    cancel: CancelToken,
}

impl TaskContext {
    pub(crate) fn new(key: Key, inputs: Vec<(Key, Value)>, cancel: CancelToken) -> Self {
        TaskContext {
            key,
            inputs,
            requests: Vec::new(),
            cancel,
        }
    }

    pub(crate) fn into_requests(self) -> Vec<(Key, DepKind)> {
        self.requests
    }

    /// The key this task is building.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The value of an input requested in an earlier step.
    pub fn input(&self, key: &Key) -> Option<&Value> {
        self.inputs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// All available inputs, in request order.
    pub fn inputs(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.inputs.iter().map(|(k, v)| (k, v))
    }

    /// Ask for key to be built and delivered in a later step.
    pub fn request(&mut self, key: impl Into<Key>) {
        self.requests.push((key.into(), DepKind::Input));
    }

    /// Returns the input if it is available, otherwise requests it.
    pub fn need(&mut self, key: impl Into<Key>) -> Option<Value> {
        let key = key.into();
        match self.input(&key) {
            Some(value) => Some(value.clone()),
            None => {
                self.requests.push((key, DepKind::Input));
                None
            }
        }
    }

    /// Require key to be built before this task runs again, without
    /// depending on its value.
    pub fn must_follow(&mut self, key: impl Into<Key>) {
        self.requests.push((key.into(), DepKind::OrderOnly));
    }

    /// Whether the build is being cancelled; long-running tasks should
    /// check this and bail out early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A task that reruns a pure function from scratch on every step.
/// The function calls `need` for each input; when any is missing it returns
/// `Ok(None)` and is re-run once the inputs arrive.
struct FnTask<F> {
    f: Arc<F>,
}

impl<F> Task for FnTask<F>
where
    F: Fn(&mut TaskContext) -> anyhow::Result<Option<Value>> + Send + Sync,
{
    fn run(&mut self, cx: &mut TaskContext) -> anyhow::Result<Step> {
        Ok(match (self.f)(cx)? {
            Some(value) => Step::Complete(value),
            None => Step::Pending,
        })
    }
}

type ValidFn = dyn Fn(&Key, &Value) -> bool + Send + Sync;

/// A Rule built from closures.
pub struct FnRule<F> {
    f: Arc<F>,
    valid: Option<Box<ValidFn>>,
}

impl<F> FnRule<F>
where
    F: Fn(&mut TaskContext) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        FnRule {
            f: Arc::new(f),
            valid: None,
        }
    }

    /// Use `valid` as the rule's `is_result_valid` check.
    pub fn with_validity(
        mut self,
        valid: impl Fn(&Key, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.valid = Some(Box::new(valid));
        self
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&mut TaskContext) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
{
    fn create_task(&self, _key: &Key) -> Box<dyn Task> {
        Box::new(FnTask { f: self.f.clone() })
    }

    fn is_result_valid(&self, key: &Key, prior: &Value) -> bool {
        match &self.valid {
            Some(valid) => valid(key, prior),
            None => true,
        }
    }
}

/// The registry mapping keys to rules.
#[derive(Default, Clone)]
pub struct Rules {
    exact: FxHashMap<Key, Arc<dyn Rule>>,
    /// Sorted longest prefix first.
    prefixes: Vec<(Vec<u8>, Arc<dyn Rule>)>,
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register rule for exactly key.  Replaces any earlier registration.
    pub fn register(&mut self, key: impl Into<Key>, rule: impl Rule + 'static) {
        self.exact.insert(key.into(), Arc::new(rule));
    }

    /// Register rule for every key starting with prefix.  Exact
    /// registrations take precedence, then the longest matching prefix.
    pub fn register_prefix(&mut self, prefix: impl AsRef<[u8]>, rule: impl Rule + 'static) {
        let prefix = prefix.as_ref().to_vec();
        self.prefixes.retain(|(p, _)| *p != prefix);
        self.prefixes.push((prefix, Arc::new(rule)));
        self.prefixes.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
    }

    pub fn lookup(&self, key: &Key) -> Option<Arc<dyn Rule>> {
        if let Some(rule) = self.exact.get(key) {
            return Some(rule.clone());
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix))
            .map(|(_, rule)| rule.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(s: &'static str) -> impl Rule {
        FnRule::new(move |_: &mut TaskContext| Ok(Some(Value::new(s))))
    }

    fn run_once(rules: &Rules, key: &str) -> Option<Value> {
        let key = Key::from(key);
        let mut task = rules.lookup(&key)?.create_task(&key);
        let mut cx = TaskContext::new(key, Vec::new(), CancelToken::new());
        match task.run(&mut cx).ok()? {
            Step::Complete(v) => Some(v),
            Step::Pending => None,
        }
    }

    #[test]
    fn lookup_precedence() {
        let mut rules = Rules::new();
        rules.register_prefix("file:", constant("file"));
        rules.register_prefix("file:gen/", constant("gen"));
        rules.register("file:gen/special", constant("special"));

        let data = |k: &str| run_once(&rules, k).map(|v| v.as_str().unwrap_or("").to_string());
        assert_eq!(data("file:a.c").as_deref(), Some("file"));
        assert_eq!(data("file:gen/b.c").as_deref(), Some("gen"));
        assert_eq!(data("file:gen/special").as_deref(), Some("special"));
        assert!(rules.lookup(&Key::from("target:all")).is_none());
    }

    #[test]
    fn need_requests_missing_inputs() -> anyhow::Result<()> {
        let rule = FnRule::new(|cx: &mut TaskContext| {
            let a = cx.need("a");
            let b = cx.need("b");
            Ok(match (a, b) {
                (Some(a), Some(b)) => Some(Value::new([a.data(), b.data()].concat())),
                _ => None,
            })
        });
        let key = Key::from("ab");
        let mut task = rule.create_task(&key);

        let mut cx = TaskContext::new(key.clone(), Vec::new(), CancelToken::new());
        assert!(matches!(task.run(&mut cx)?, Step::Pending));
        let requested: Vec<String> = cx.into_requests().iter().map(|(k, _)| k.to_string()).collect();
        assert_eq!(requested, vec!["a", "b"]);

        let inputs = vec![
            (Key::from("a"), Value::new("x")),
            (Key::from("b"), Value::new("y")),
        ];
        let mut cx = TaskContext::new(key, inputs, CancelToken::new());
        match task.run(&mut cx)? {
            Step::Complete(v) => assert_eq!(v.as_str(), Some("xy")),
            Step::Pending => panic!("expected completion"),
        }
        assert!(cx.into_requests().is_empty());
        Ok(())
    }
}
