//! Rules for `file:` keys, which stand for files on disk that are inputs to
//! the build.

use crate::key::Key;
use crate::rule::{Rule, Step, Task, TaskContext};
use crate::value::{Fingerprint, Signature, Value};
use anyhow::{anyhow, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

/// Key prefix handled by FileRule.
pub const PREFIX: &str = "file:";

/// The key naming the file at path.
pub fn file_key(path: impl AsRef<Path>) -> Key {
    Key::from(format!("{}{}", PREFIX, path.as_ref().display()))
}

fn key_path(key: &Key) -> anyhow::Result<PathBuf> {
    let rest = key
        .strip_prefix(PREFIX.as_bytes())
        .ok_or_else(|| anyhow!("{} is not a file key", key))?;
    let path = std::str::from_utf8(rest).map_err(|_| anyhow!("{} is not valid UTF-8", key))?;
    Ok(PathBuf::from(path))
}

/// MTime info gathered for a file.  This also models "file is absent".
/// It's not using an Option<> just because it makes the code using it easier
/// to follow.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MTime {
    Missing,
    /// Nanoseconds since the Unix epoch.
    Stamp(u64),
}

pub trait FileSystem: Send + Sync {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &Path) -> std::io::Result<MTime>;
}

#[derive(Default)]
pub struct RealFileSystem {}
impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn stat(&self, path: &Path) -> std::io::Result<MTime> {
        Ok(match std::fs::metadata(path) {
            Ok(meta) => {
                let nanos = meta
                    .modified()?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                MTime::Stamp(nanos)
            }
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    MTime::Missing
                } else {
                    return Err(err);
                }
            }
        })
    }
}

/// How a file's signature is computed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stamp {
    /// The signature is the modification time.  The value's data is the
    /// path; the file is not read.
    MTime,
    /// The signature is a fingerprint of the contents, which are also the
    /// value's data.  Touching a file without changing it changes nothing.
    Content,
}

pub struct FileRule<F> {
    fs: Arc<F>,
    stamp: Stamp,
}

impl<F: FileSystem> FileRule<F> {
    pub fn new(fs: F, stamp: Stamp) -> Self {
        FileRule {
            fs: Arc::new(fs),
            stamp,
        }
    }
}

impl FileRule<RealFileSystem> {
    pub fn real(stamp: Stamp) -> Self {
        FileRule::new(RealFileSystem::new(), stamp)
    }
}

fn stamp_file<F: FileSystem>(fs: &F, stamp: Stamp, path: &Path) -> anyhow::Result<Value> {
    match stamp {
        Stamp::MTime => match fs.stat(path)? {
            MTime::Missing => bail!("{}: missing", path.display()),
            MTime::Stamp(mtime) => Ok(Value::with_token(
                path.to_string_lossy().as_bytes(),
                mtime,
            )),
        },
        Stamp::Content => {
            let data = fs.read(path).map_err(|err| anyhow!("read {}: {}", path.display(), err))?;
            Ok(Value::new(data))
        }
    }
}

struct FileTask<F> {
    fs: Arc<F>,
    stamp: Stamp,
}

impl<F: FileSystem + 'static> Task for FileTask<F> {
    fn run(&mut self, cx: &mut TaskContext) -> anyhow::Result<Step> {
        let path = key_path(cx.key())?;
        Ok(Step::Complete(stamp_file(&*self.fs, self.stamp, &path)?))
    }
}

impl<F: FileSystem + 'static> Rule for FileRule<F> {
    fn create_task(&self, _key: &Key) -> Box<dyn Task> {
        Box::new(FileTask {
            fs: self.fs.clone(),
            stamp: self.stamp,
        })
    }

    fn is_result_valid(&self, key: &Key, prior: &Value) -> bool {
        let path = match key_path(key) {
            Ok(path) => path,
            Err(_) => return false,
        };
        let current = match self.stamp {
            Stamp::MTime => match self.fs.stat(&path) {
                Ok(MTime::Stamp(mtime)) => Signature::Token(mtime),
                _ => return false,
            },
            Stamp::Content => match self.fs.read(&path) {
                Ok(data) => Signature::Fingerprint(Fingerprint::of(&data)),
                Err(_) => return false,
            },
        };
        current == *prior.signature()
    }
}
