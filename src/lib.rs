//! An incremental build engine with dynamically discovered dependencies.
//!
//! Front ends register [`rule::Rule`]s for keys and ask an
//! [`engine::Engine`] to build some of them.  Tasks discover their inputs as
//! they run; the engine records them in a [`db::Database`] so the next build
//! only reruns what changed.

pub mod db;
mod densemap;
pub mod engine;
pub mod error;
pub mod fs;
pub mod graph;
pub mod key;
pub mod progress;
pub mod rule;
mod runner;
pub mod signal;
mod trace;
pub mod value;

pub use engine::{BuildReport, Config, Diagnostic, Engine};
pub use error::{DbError, Error, Failure};
pub use key::Key;
pub use rule::{CancelToken, FnRule, Rule, Rules, Step, Task, TaskContext};
pub use value::{Signature, Value};

/// The version string reported by the tool.
pub fn version() -> &'static str {
    concat!("buildcore version ", env!("CARGO_PKG_VERSION"))
}
