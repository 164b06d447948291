//! Shared value types
//!
//! - [`OpenMode`]: how a store is opened
//! - [`IndexKey`]: key of a secondary index entry, with its namespacing convention

use std::borrow::Borrow;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::AtlasError;

/// Keys are opaque byte strings
pub type Key = Bytes;

/// Values are opaque byte strings
pub type Value = Bytes;

// =============================================================================
// Open Mode
// =============================================================================

/// Flags controlling how a store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenMode(u32);

impl OpenMode {
    /// Open for reading
    pub const READER: OpenMode = OpenMode(1 << 0);
    /// Open for reading and writing
    pub const WRITER: OpenMode = OpenMode(1 << 1);
    /// Create the repository if it does not exist
    pub const CREATE: OpenMode = OpenMode(1 << 2);
    /// Discard existing contents
    pub const TRUNCATE: OpenMode = OpenMode(1 << 3);
    /// Persist after every committed mutation
    ///
    /// Best effort: a failed sync is logged and the mutation still succeeds.
    pub const AUTO_SYNC: OpenMode = OpenMode(1 << 5);

    pub const fn empty() -> Self {
        OpenMode(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        OpenMode(bits)
    }

    pub const fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether mutations are allowed
    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITER)
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        OpenMode(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenMode {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Parse an fopen-style mode string
///
/// - `r`  - read only (repository must exist)
/// - `r+` - read/write (repository must exist)
/// - `w+` - read/write, always start empty
/// - `a+` - read/write, create if missing
impl FromStr for OpenMode {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "r" => Ok(OpenMode::READER),
            "r+" => Ok(OpenMode::WRITER),
            "w+" => Ok(OpenMode::WRITER | OpenMode::CREATE | OpenMode::TRUNCATE),
            "a+" => Ok(OpenMode::WRITER | OpenMode::CREATE),
            _ => Err(AtlasError::InvalidRequest(format!(
                "badly formatted mode: `{}`",
                s
            ))),
        }
    }
}

// =============================================================================
// Index Keys
// =============================================================================

/// Key of a secondary index entry
///
/// Index entries share the keyspace with primary records. Keys built with
/// [`IndexKey::new`] live under `~idx/<namespace>/<attribute>`, so a whole
/// index can be listed with a prefix match on
/// [`IndexKey::namespace_prefix`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(Bytes);

impl IndexKey {
    /// Prefix shared by every namespaced index key
    pub const PREFIX: &'static [u8] = b"~idx/";

    /// Build a namespaced index key
    pub fn new(namespace: &str, attribute: impl AsRef<[u8]>) -> Self {
        let attribute = attribute.as_ref();
        let mut buf =
            BytesMut::with_capacity(Self::PREFIX.len() + namespace.len() + 1 + attribute.len());
        buf.put_slice(Self::PREFIX);
        buf.put_slice(namespace.as_bytes());
        buf.put_u8(b'/');
        buf.put_slice(attribute);
        IndexKey(buf.freeze())
    }

    /// Use the given bytes verbatim, outside the namespacing convention
    pub fn raw(key: impl Into<Bytes>) -> Self {
        IndexKey(key.into())
    }

    /// Prefix matching every key of one namespace
    pub fn namespace_prefix(namespace: &str) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::PREFIX.len() + namespace.len() + 1);
        buf.put_slice(Self::PREFIX);
        buf.put_slice(namespace.as_bytes());
        buf.put_u8(b'/');
        buf.freeze()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for IndexKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for IndexKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl From<IndexKey> for Bytes {
    fn from(key: IndexKey) -> Self {
        key.0
    }
}

impl fmt::Debug for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexKey({})", String::from_utf8_lossy(&self.0))
    }
}
