//! Values are the results of building keys; Signatures fingerprint them.
//!
//! Dependents only need to re-run when the Signature of an input changes,
//! not merely because the input was rebuilt.  That comparison is what lets a
//! rebuild stop early ("cutoff").

use std::fmt;
use std::sync::Arc;

/// A fixed-width content hash.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(data: &[u8]) -> Self {
        Fingerprint(*blake3::hash(data).as_bytes())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first eight bytes are plenty to tell values apart in logs.
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Identifies one version of a Value for change detection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Signature {
    /// Hash of the value's content.  The default.
    Fingerprint(Fingerprint),
    /// A change token supplied by the rule, e.g. a modification time.
    Token(u64),
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Fingerprint(fp) => write!(f, "{:?}", fp),
            Signature::Token(t) => write!(f, "token:{}", t),
        }
    }
}

/// The successful result of building a Key.  Immutable and cheap to clone;
/// the payload is shared between the engine, the database and tasks.
#[derive(Clone, PartialEq, Eq)]
pub struct Value {
    data: Arc<[u8]>,
    signature: Signature,
}

impl Value {
    /// A value whose signature is the fingerprint of its content.
    pub fn new(data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        Value {
            signature: Signature::Fingerprint(Fingerprint::of(data)),
            data: Arc::from(data),
        }
    }

    /// A value with an explicit change token as its signature.
    pub fn with_token(data: impl AsRef<[u8]>, token: u64) -> Self {
        Value {
            data: Arc::from(data.as_ref()),
            signature: Signature::Token(token),
        }
    }

    pub(crate) fn from_parts(data: Vec<u8>, signature: Signature) -> Self {
        Value {
            data: Arc::from(data),
            signature,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("len", &self.data.len())
            .field("signature", &self.signature)
            .finish()
    }
}
