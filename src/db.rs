//! The build database stores the results of previous builds, for deciding
//! which keys are still up to date.
//!
//! The file is an append-only log.  After a header (magic + schema version)
//! it holds a sequence of entries:
//!
//! ```text
//!   tag: u8 | len: u32 | payload: [u8; len] | checksum: u64
//! ```
//!
//! where the checksum covers tag, len and payload.  Keys are written once
//! and referred to by their index afterwards.  A newer record for a key
//! supersedes the older one, so each update is a single append: a crash
//! leaves either the old record or the complete new one.  A trailing entry
//! cut short by a crash is dropped on open.

use crate::error::DbError;
use crate::key::Key;
use crate::value::{Fingerprint, Signature, Value};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAGIC: &[u8; 4] = b"bcdb";
/// Bump this whenever the entry encoding changes.
pub const VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

const TAG_KEY: u8 = 1;
const TAG_RECORD: u8 = 2;
const TAG_EPOCH: u8 = 3;

/// Index of a key within one database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Id(u32);

/// An input recorded for a completed build, with the input's signature as
/// it was when the build ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub key: Key,
    pub signature: Signature,
}

/// Everything remembered about the last successful build of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: Value,
    /// Inputs in the order the task requested them.
    pub dependencies: Vec<Dependency>,
    /// Epoch in which the value's signature last changed.
    pub built_at: u64,
    /// Epoch in which the value was last computed.
    pub computed_at: u64,
}

impl Record {
    pub fn signature(&self) -> &Signature {
        self.value.signature()
    }
}

fn checksum(tag: u8, payload: &[u8]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&(payload.len() as u32).to_le_bytes());
    hasher.update(payload);
    let hash = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(first)
}

/// Encodes entries into a buffer that is later appended in one write.
#[derive(Default)]
struct EntryWriter {
    buf: Vec<u8>,
    payload: Vec<u8>,
}

impl EntryWriter {
    fn u8(&mut self, v: u8) {
        self.payload.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.payload.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.payload.extend_from_slice(&v.to_le_bytes());
    }
    fn bytes(&mut self, b: &[u8]) {
        self.u32(b.len() as u32);
        self.payload.extend_from_slice(b);
    }
    fn signature(&mut self, sig: &Signature) {
        match sig {
            Signature::Fingerprint(fp) => {
                self.u8(0);
                self.payload.extend_from_slice(&fp.0);
            }
            Signature::Token(t) => {
                self.u8(1);
                self.u64(*t);
            }
        }
    }

    /// Seal the payload written so far as one entry.
    fn finish_entry(&mut self, tag: u8) {
        let sum = checksum(tag, &self.payload);
        self.buf.push(tag);
        self.buf
            .extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&self.payload);
        self.buf.extend_from_slice(&sum.to_le_bytes());
        self.payload.clear();
    }
}

/// Cursor over a byte slice; every read returns None if the input is short.
struct BReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        BReader { buf, pos: 0 }
    }
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(s)
    }
    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }
    fn u32(&mut self) -> Option<u32> {
        let b = self.take(4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u64(&mut self) -> Option<u64> {
        let mut a = [0u8; 8];
        a.copy_from_slice(self.take(8)?);
        Some(u64::from_le_bytes(a))
    }
    fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }
    fn signature(&mut self) -> Option<Signature> {
        match self.u8()? {
            0 => {
                let mut fp = [0u8; 32];
                fp.copy_from_slice(self.take(32)?);
                Some(Signature::Fingerprint(Fingerprint(fp)))
            }
            1 => Some(Signature::Token(self.u64()?)),
            _ => None,
        }
    }
}

/// The decoded contents of a database file.
#[derive(Default)]
struct State {
    keys: Vec<Key>,
    ids: FxHashMap<Key, Id>,
    records: Vec<Option<Record>>,
    epoch: u64,
    /// Count of record entries in the file, live or superseded.
    record_entries: usize,
    /// Count of epoch entries; all but the last are superseded.
    epoch_entries: usize,
}

impl State {
    fn add_key(&mut self, key: Key) -> Id {
        let id = Id(self.keys.len() as u32);
        self.ids.insert(key.clone(), id);
        self.keys.push(key);
        self.records.push(None);
        id
    }

    fn key(&self, id: u32) -> Option<&Key> {
        self.keys.get(id as usize)
    }

    fn live(&self) -> usize {
        self.records.iter().filter(|r| r.is_some()).count()
    }

    fn decode_entry(&mut self, tag: u8, payload: &[u8]) -> Option<()> {
        let mut r = BReader::new(payload);
        match tag {
            TAG_KEY => {
                let key = Key::new(r.take(r.remaining())?);
                self.add_key(key);
            }
            TAG_RECORD => {
                let id = r.u32()?;
                self.key(id)?;
                let data = r.bytes()?.to_vec();
                let signature = r.signature()?;
                let built_at = r.u64()?;
                let computed_at = r.u64()?;
                let count = r.u32()? as usize;
                let mut dependencies = Vec::with_capacity(count.min(r.remaining()));
                for _ in 0..count {
                    let dep = r.u32()?;
                    let key = self.key(dep)?.clone();
                    let signature = r.signature()?;
                    dependencies.push(Dependency { key, signature });
                }
                if r.remaining() != 0 {
                    return None;
                }
                self.records[id as usize] = Some(Record {
                    value: Value::from_parts(data, signature),
                    dependencies,
                    built_at,
                    computed_at,
                });
                self.record_entries += 1;
            }
            TAG_EPOCH => {
                self.epoch = r.u64()?;
                self.epoch_entries += 1;
            }
            _ => return None,
        }
        Some(())
    }
}

/// Result of decoding a file.
struct Loaded {
    state: State,
    /// Length of the valid prefix of the file.
    good_len: u64,
}

/// The offset of the first well-formed entry (known tag, in-bounds length,
/// matching checksum) at or after from.
fn find_entry(bytes: &[u8], from: usize) -> Option<usize> {
    (from..bytes.len()).find(|&pos| {
        let mut r = BReader::new(bytes);
        r.pos = pos;
        let entry = (|| {
            let tag = r.u8()?;
            if !matches!(tag, TAG_KEY | TAG_RECORD | TAG_EPOCH) {
                return None;
            }
            let len = r.u32()? as usize;
            let payload = r.take(len)?;
            Some((tag, payload, r.u64()?))
        })();
        matches!(entry, Some((tag, payload, sum)) if sum == checksum(tag, payload))
    })
}

fn decode(bytes: &[u8]) -> Result<Loaded, DbError> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(DbError::Corrupt {
            offset: 0,
            reason: "bad header".into(),
        });
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != VERSION {
        return Err(DbError::VersionMismatch {
            found: version,
            expected: VERSION,
        });
    }

    let mut state = State::default();
    let mut r = BReader::new(bytes);
    r.pos = HEADER_LEN;
    loop {
        let start = r.pos;
        if r.remaining() == 0 {
            break;
        }
        let entry = (|| {
            let tag = r.u8()?;
            let len = r.u32()? as usize;
            let payload = r.take(len)?;
            let sum = r.u64()?;
            Some((tag, payload, sum))
        })();
        let (tag, payload, sum) = match entry {
            Some(e) => e,
            None => {
                // A torn write is the end of the file.  A short entry with
                // intact entries behind it has a damaged length instead.
                if let Some(next) = find_entry(bytes, start + 1) {
                    return Err(DbError::Corrupt {
                        offset: start as u64,
                        reason: format!("entry overruns the entry at offset {}", next),
                    });
                }
                warn!(offset = start, "dropping truncated database entry");
                r.pos = start;
                break;
            }
        };
        if sum != checksum(tag, payload) {
            if r.remaining() == 0 {
                warn!(offset = start, "dropping torn database entry");
                r.pos = start;
                break;
            }
            return Err(DbError::Corrupt {
                offset: start as u64,
                reason: "checksum mismatch".into(),
            });
        }
        if state.decode_entry(tag, payload).is_none() {
            return Err(DbError::Corrupt {
                offset: start as u64,
                reason: format!("malformed entry with tag {}", tag),
            });
        }
    }
    Ok(Loaded {
        state,
        good_len: r.pos as u64,
    })
}

fn header() -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf
}

/// A build database file, loaded into memory and open for appending.
pub struct Database {
    path: PathBuf,
    /// None when opened read-only.
    file: Option<File>,
    state: State,
    /// Length of the file's valid content.
    len: u64,
    sync_writes: bool,
}

impl Database {
    /// Open an existing database or create a new one at path.
    /// A torn trailing entry is cut off; other damage is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Database, DbError> {
        let path = path.as_ref();
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Database::create(path);
            }
            Err(err) => return Err(err.into()),
        };
        if bytes.is_empty() {
            return Database::create(path);
        }
        let loaded = decode(&bytes)?;
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        if loaded.good_len < bytes.len() as u64 {
            file.set_len(loaded.good_len)?;
        }
        debug!(
            path = %path.display(),
            keys = loaded.state.keys.len(),
            epoch = loaded.state.epoch,
            "opened database"
        );
        Ok(Database {
            path: path.to_path_buf(),
            file: Some(file),
            state: loaded.state,
            len: loaded.good_len,
            sync_writes: false,
        })
    }

    /// Create an empty database at path, replacing any existing file.
    pub fn create(path: impl AsRef<Path>) -> Result<Database, DbError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = File::create(path)?;
        let header = header();
        file.write_all(&header)?;
        file.sync_data()?;
        drop(file);
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        Ok(Database {
            path: path.to_path_buf(),
            file: Some(file),
            state: State::default(),
            len: header.len() as u64,
            sync_writes: false,
        })
    }

    /// Open a database for inspection only.  The file is never modified.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Database, DbError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let loaded = decode(&bytes)?;
        Ok(Database {
            path: path.to_path_buf(),
            file: None,
            state: loaded.state,
            len: loaded.good_len,
            sync_writes: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// When set, every write is followed by an fsync.
    pub fn set_sync_writes(&mut self, sync: bool) {
        self.sync_writes = sync;
    }

    /// The epoch of the most recent build recorded in this database.
    pub fn epoch(&self) -> u64 {
        self.state.epoch
    }

    pub fn get(&self, key: &Key) -> Option<&Record> {
        let id = self.state.ids.get(key)?;
        self.state.records[id.0 as usize].as_ref()
    }

    /// All live records, in the order their keys were first written.
    pub fn records(&self) -> impl Iterator<Item = (&Key, &Record)> {
        self.state
            .keys
            .iter()
            .zip(self.state.records.iter())
            .filter_map(|(key, record)| record.as_ref().map(|r| (key, r)))
    }

    pub fn len(&self) -> usize {
        self.state.live()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Superseded entries per live record.
    pub fn garbage_ratio(&self) -> f64 {
        let live = self.state.live();
        let dead = self.state.record_entries - live + self.state.epoch_entries.saturating_sub(1);
        if live == 0 {
            return dead as f64;
        }
        dead as f64 / live as f64
    }

    fn ensure_id(&mut self, key: &Key, w: &mut EntryWriter) -> Id {
        if let Some(&id) = self.state.ids.get(key) {
            return id;
        }
        w.payload.extend_from_slice(key.as_bytes());
        w.finish_entry(TAG_KEY);
        self.state.add_key(key.clone())
    }

    /// Append buf to the file as one write.  On failure the file is cut back
    /// to its previous length so a partial entry never precedes later ones.
    fn append(&mut self, buf: &[u8]) -> Result<(), DbError> {
        let file = self.file.as_mut().ok_or(DbError::ReadOnly)?;
        let result = file.write_all(buf).and_then(|()| {
            if self.sync_writes {
                file.sync_data()
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => {
                self.len += buf.len() as u64;
                Ok(())
            }
            Err(err) => {
                // Best effort; the torn tail is also dropped on next open.
                let _ = file.set_len(self.len);
                Err(err.into())
            }
        }
    }

    /// Forget keys interned for a write that did not reach the file.
    fn rollback_keys(&mut self, mark: usize) {
        for key in self.state.keys.drain(mark..) {
            self.state.ids.remove(&key);
        }
        self.state.records.truncate(mark);
    }

    /// Persist the record for key, replacing any previous one.
    pub fn put(&mut self, key: &Key, record: Record) -> Result<(), DbError> {
        if self.file.is_none() {
            return Err(DbError::ReadOnly);
        }
        let mark = self.state.keys.len();
        let mut w = EntryWriter::default();
        let id = self.ensure_id(key, &mut w);
        let dep_ids: Vec<Id> = record
            .dependencies
            .iter()
            .map(|dep| self.ensure_id(&dep.key, &mut w))
            .collect();

        w.u32(id.0);
        w.bytes(record.value.data());
        w.signature(record.value.signature());
        w.u64(record.built_at);
        w.u64(record.computed_at);
        w.u32(dep_ids.len() as u32);
        for (dep, dep_id) in record.dependencies.iter().zip(&dep_ids) {
            w.u32(dep_id.0);
            w.signature(&dep.signature);
        }
        w.finish_entry(TAG_RECORD);

        if let Err(err) = self.append(&w.buf) {
            self.rollback_keys(mark);
            return Err(err);
        }
        self.state.records[id.0 as usize] = Some(record);
        self.state.record_entries += 1;
        Ok(())
    }

    /// Record the epoch of a build that is starting.
    pub fn set_epoch(&mut self, epoch: u64) -> Result<(), DbError> {
        let mut w = EntryWriter::default();
        w.u64(epoch);
        w.finish_entry(TAG_EPOCH);
        self.append(&w.buf)?;
        self.state.epoch = epoch;
        self.state.epoch_entries += 1;
        Ok(())
    }

    /// Rewrite the file with only live records.  The new file replaces the
    /// old one with a rename, so a crash leaves one or the other.
    pub fn compact(&mut self) -> Result<(), DbError> {
        if self.file.is_none() {
            return Err(DbError::ReadOnly);
        }
        let old = std::mem::take(&mut self.state);
        let mut fresh = Database {
            path: self.path.clone(),
            file: None,
            state: State::default(),
            len: 0,
            sync_writes: false,
        };
        let mut w = EntryWriter::default();
        w.u64(old.epoch);
        w.finish_entry(TAG_EPOCH);
        for (key, record) in old
            .keys
            .iter()
            .zip(old.records.iter())
            .filter_map(|(k, r)| r.as_ref().map(|r| (k, r)))
        {
            let id = fresh.ensure_id(key, &mut w);
            let dep_ids: Vec<Id> = record
                .dependencies
                .iter()
                .map(|dep| fresh.ensure_id(&dep.key, &mut w))
                .collect();
            w.u32(id.0);
            w.bytes(record.value.data());
            w.signature(record.value.signature());
            w.u64(record.built_at);
            w.u64(record.computed_at);
            w.u32(dep_ids.len() as u32);
            for (dep, dep_id) in record.dependencies.iter().zip(&dep_ids) {
                w.u32(dep_id.0);
                w.signature(&dep.signature);
            }
            w.finish_entry(TAG_RECORD);
            fresh.state.records[id.0 as usize] = Some(record.clone());
            fresh.state.record_entries += 1;
        }
        fresh.state.epoch = old.epoch;
        fresh.state.epoch_entries = 1;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let result = (|| -> std::io::Result<(File, u64)> {
            let mut tmp = File::create(&tmp_path)?;
            let header = header();
            tmp.write_all(&header)?;
            tmp.write_all(&w.buf)?;
            tmp.sync_all()?;
            // The handle follows the file through the rename.
            let file = std::fs::OpenOptions::new().append(true).open(&tmp_path)?;
            std::fs::rename(&tmp_path, &self.path)?;
            Ok((file, (header.len() + w.buf.len()) as u64))
        })();
        let (file, len) = match result {
            Ok(done) => done,
            Err(err) => {
                self.state = old;
                let _ = std::fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        };
        debug!(
            path = %self.path.display(),
            live = fresh.state.live(),
            dropped = old.record_entries - fresh.state.record_entries,
            "compacted database"
        );
        self.file = Some(file);
        self.state = fresh.state;
        self.len = len;
        Ok(())
    }
}
