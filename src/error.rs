use crate::key::Key;
use thiserror::Error;

/// Why a key did not produce a value.  Stored in place of the value in the
/// build results and propagated to dependents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("no rule to build {0}")]
    RuleNotFound(Key),

    /// The task ran and reported an error.  Not retried automatically.
    #[error("task failed: {0}")]
    Task(String),

    /// The key takes part in a dependency cycle; the keys are listed in
    /// request order, starting and ending with the same key.
    #[error("dependency cycle: {}", format_cycle(.0))]
    Cycle(Vec<Key>),

    /// An input the task requested failed, so the task never ran.
    #[error("input {0} failed")]
    Dependency(Key),

    #[error("cancelled")]
    Cancelled,

    /// The result could not be persisted.
    #[error("database: {0}")]
    Database(String),
}

fn format_cycle(keys: &[Key]) -> String {
    keys.iter()
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("database corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("database opened read-only")]
    ReadOnly,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Whether the file is unusable and must be discarded and rebuilt.
    pub fn needs_reset(&self) -> bool {
        matches!(self, DbError::VersionMismatch { .. } | DbError::Corrupt { .. })
    }
}

/// Errors setting up an engine.  Errors during a build are reported per key
/// as Failures instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("open {path}: {source}")]
    Db {
        path: String,
        #[source]
        source: DbError,
    },

    #[error("start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message() {
        let f = Failure::Cycle(vec![Key::from("a"), Key::from("b"), Key::from("a")]);
        assert_eq!(f.to_string(), "dependency cycle: a -> b -> a");
    }
}
