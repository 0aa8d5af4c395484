//! Keys name buildable artifacts and logical targets.
//!
//! A Key is an opaque byte string.  Front ends conventionally give keys a
//! "type" with a prefix such as `file:` and register rules per prefix.  The
//! engine interns keys into dense KeyIds so per-build state can live in
//! vectors rather than hash maps.

use crate::densemap::{self, DenseMap};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// An immutable identifier of a buildable artifact.  Cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<[u8]>);

impl Key {
    pub fn new(bytes: impl AsRef<[u8]>) -> Self {
        Key(Arc::from(bytes.as_ref()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The key as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }

    /// The remainder of the key after a type prefix like `file:`.
    pub fn strip_prefix(&self, prefix: &[u8]) -> Option<&[u8]> {
        self.0.strip_prefix(prefix)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key::new(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Key {
        Key::new(s)
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Key {
        Key::new(b)
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Key {
        k.clone()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Dense index of an interned Key within one engine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct KeyId(u32);

impl densemap::Index for KeyId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<usize> for KeyId {
    fn from(u: usize) -> KeyId {
        KeyId(u as u32)
    }
}

/// Interns Keys, handing out KeyIds in insertion order.
#[derive(Default)]
pub struct KeyTable {
    ids: FxHashMap<Key, KeyId>,
    keys: DenseMap<KeyId, Key>,
}

impl KeyTable {
    pub fn intern(&mut self, key: &Key) -> KeyId {
        if let Some(&id) = self.ids.get(key) {
            return id;
        }
        let id = self.keys.push(key.clone());
        self.ids.insert(key.clone(), id);
        id
    }

    pub fn lookup(&self, key: &Key) -> Option<KeyId> {
        self.ids.get(key).copied()
    }

    pub fn key(&self, id: KeyId) -> &Key {
        &self.keys[id]
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}
