//! Engine Module
//!
//! The contract AtlasCab consumes from a key-value engine, plus a bundled
//! in-memory reference engine.
//!
//! ## Responsibilities of an engine
//! - Point reads and writes (get/set/add/replace/append/remove)
//! - Counters and compare-and-swap
//! - Bulk operations and key matching
//! - Transactions and per-key atomic visits
//! - Positional cursors
//!
//! An engine is shared by every in-flight request as `Arc<dyn Store>`, so
//! all methods take `&self` and implementations synchronize internally.

mod cursor;
mod memory;
pub mod snapshot;

use std::collections::BTreeMap;
use std::path::Path;

use bytes::Bytes;
use regex::bytes::Regex;

use crate::error::EngineResult;
use crate::types::OpenMode;

pub use cursor::MemoryCursor;
pub use memory::MemoryStore;

// =============================================================================
// Visitors
// =============================================================================

/// What a visitor wants done with the record it inspected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitAction {
    /// Leave the record as it is (or absent)
    Keep,
    /// Store this value
    Set(Bytes),
    /// Remove the record
    Remove,
}

/// Inspect-and-mutate logic run by the engine under its own lock
///
/// `current` is `None` when no record exists for `key`.
pub trait Visitor {
    fn visit(&mut self, key: &[u8], current: Option<&[u8]>) -> VisitAction;
}

impl<F> Visitor for F
where
    F: FnMut(&[u8], Option<&[u8]>) -> VisitAction,
{
    fn visit(&mut self, key: &[u8], current: Option<&[u8]>) -> VisitAction {
        self(key, current)
    }
}

// =============================================================================
// Store Handle
// =============================================================================

/// A single logical connection to a key-value engine
pub trait Store: Send + Sync {
    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------
    fn open(&self, path: &str, mode: OpenMode) -> EngineResult<()>;

    fn close(&self) -> EngineResult<()>;

    /// Remove every record
    fn clear(&self) -> EngineResult<()>;

    // -------------------------------------------------------------------------
    // Point Operations
    // -------------------------------------------------------------------------

    /// Fails with `RecordNotFound` when the key is absent
    fn get(&self, key: &[u8]) -> EngineResult<Bytes>;

    fn set(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Fails with `DuplicateRecord` when the key exists
    fn add(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Fails with `RecordNotFound` when the key is absent
    fn replace(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    fn append(&self, key: &[u8], value: &[u8]) -> EngineResult<()>;

    /// Fails with `RecordNotFound` when the key is absent
    fn remove(&self, key: &[u8]) -> EngineResult<()>;

    /// Add `delta` to the integer at `key`, seeding absent keys with `initial`
    fn increment(&self, key: &[u8], delta: i64, initial: i64) -> EngineResult<i64>;

    fn increment_float(&self, key: &[u8], delta: f64, initial: f64) -> EngineResult<f64>;

    /// Swap `old` for `new` atomically
    ///
    /// `old = None` requires the key to be absent, `new = None` removes it.
    /// Returns `false` without mutating on mismatch.
    fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> EngineResult<bool>;

    // -------------------------------------------------------------------------
    // Bulk Operations
    // -------------------------------------------------------------------------

    /// Fetch the records that exist among `keys`
    fn get_bulk(&self, keys: &[Bytes], atomic: bool) -> EngineResult<BTreeMap<Bytes, Bytes>>;

    /// Store every item, returning how many were written
    fn set_bulk(&self, items: &BTreeMap<Bytes, Bytes>, atomic: bool) -> EngineResult<usize>;

    /// Remove every key, returning how many existed
    fn remove_bulk(&self, keys: &[Bytes], atomic: bool) -> EngineResult<usize>;

    /// Keys starting with `prefix`, ascending, at most `max`
    fn match_prefix(&self, prefix: &[u8], max: Option<usize>) -> EngineResult<Vec<Bytes>>;

    /// Keys matching `pattern`, ascending, at most `max`
    fn match_regex(&self, pattern: &Regex, max: Option<usize>) -> EngineResult<Vec<Bytes>>;

    // -------------------------------------------------------------------------
    // Transactions
    // -------------------------------------------------------------------------
    fn begin_transaction(&self) -> EngineResult<()>;

    /// Commit (`true`) or abort (`false`) the current transaction
    fn end_transaction(&self, commit: bool) -> EngineResult<()>;

    /// Run `visitor` on each key atomically, returning the number visited
    fn accept_bulk(
        &self,
        keys: &[Bytes],
        visitor: &mut dyn Visitor,
        writable: bool,
    ) -> EngineResult<usize>;

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Persist contents; `hard` also syncs the device
    fn synchronize(&self, hard: bool) -> EngineResult<()>;

    /// Copy the repository to `dest`
    fn copy(&self, dest: &Path) -> EngineResult<()>;

    fn dump_snapshot(&self, dest: &Path) -> EngineResult<()>;

    /// Replace contents with the snapshot at `src`
    fn load_snapshot(&self, src: &Path) -> EngineResult<()>;

    /// Number of records
    fn count(&self) -> EngineResult<u64>;

    /// Approximate size of the contents in bytes
    fn size(&self) -> EngineResult<u64>;

    fn status(&self) -> EngineResult<BTreeMap<String, String>>;

    // -------------------------------------------------------------------------
    // Cursors
    // -------------------------------------------------------------------------
    fn cursor(&self) -> EngineResult<Box<dyn StoreCursor>>;
}

// =============================================================================
// Cursor
// =============================================================================

/// A position inside a store's key ordering
///
/// A fresh cursor has no position. "No record" is reported as
/// `RecordNotFound`; running off either end clears the position.
pub trait StoreCursor: Send {
    /// Move to the first record
    fn jump(&mut self) -> EngineResult<()>;

    /// Move to the first record with key >= `key`
    fn jump_to(&mut self, key: &[u8]) -> EngineResult<()>;

    /// Move to the last record
    fn jump_back(&mut self) -> EngineResult<()>;

    /// Move to the last record with key <= `key`
    fn jump_back_to(&mut self, key: &[u8]) -> EngineResult<()>;

    fn step(&mut self) -> EngineResult<()>;

    fn step_back(&mut self) -> EngineResult<()>;

    /// Current record, then step forward if `step`
    fn get(&mut self, step: bool) -> EngineResult<(Bytes, Bytes)>;

    fn get_key(&mut self, step: bool) -> EngineResult<Bytes>;

    fn get_value(&mut self, step: bool) -> EngineResult<Bytes>;

    /// Overwrite the current record's value, then step forward if `step`
    fn set_value(&mut self, value: &[u8], step: bool) -> EngineResult<()>;

    /// Remove the current record; the cursor moves to the next one
    fn remove(&mut self) -> EngineResult<()>;
}
