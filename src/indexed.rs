//! Indexed Write Transaction
//!
//! A primary write plus secondary index maintenance, applied all-or-nothing.
//!
//! ## Flow
//! ```text
//! no index work ──────────────► primary write (no transaction)
//!
//! index work ──► begin ──► primary write ──fail──► abort, return error
//!                              │
//!                              ▼
//!                    upsert pass (accept_bulk)
//!                    removal pass (accept_bulk)
//!                              │
//!               conflicts? ──yes──► abort, IndexConflict { every entry }
//!                              │
//!                              no
//!                              ▼
//!                           commit
//! ```
//!
//! Each index key is inspected and updated by a visitor the engine runs
//! under its own lock, never by a separate read then write. An entry that
//! belongs to a different owner is reported, not overwritten or removed.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::engine::{Store, VisitAction, Visitor};
use crate::error::{AtlasError, EngineResult, IndexErrors, Result};
use crate::types::IndexKey;

// =============================================================================
// Primary Write
// =============================================================================

/// The write made to the primary record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimaryWrite {
    /// Fails with `DuplicateRecord` if the key exists
    Add { key: Bytes, value: Bytes },
    /// Fails with `RecordNotFound` if the key is absent
    Replace { key: Bytes, value: Bytes },
    /// Fails with `RecordNotFound` if the key is absent
    Remove { key: Bytes },
}

impl PrimaryWrite {
    pub fn key(&self) -> &Bytes {
        match self {
            PrimaryWrite::Add { key, .. }
            | PrimaryWrite::Replace { key, .. }
            | PrimaryWrite::Remove { key } => key,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimaryWrite::Add { .. } => "add_indexed",
            PrimaryWrite::Replace { .. } => "replace_indexed",
            PrimaryWrite::Remove { .. } => "remove_indexed",
        }
    }

    fn apply(&self, store: &dyn Store) -> EngineResult<()> {
        match self {
            PrimaryWrite::Add { key, value } => store.add(key, value),
            PrimaryWrite::Replace { key, value } => store.replace(key, value),
            PrimaryWrite::Remove { key } => store.remove(key),
        }
    }
}

// =============================================================================
// Visitors
// =============================================================================

/// Claims each index key for its expected owner
struct ApplyIndex<'a> {
    expected: &'a BTreeMap<IndexKey, Bytes>,
    errors: &'a mut IndexErrors,
}

impl Visitor for ApplyIndex<'_> {
    fn visit(&mut self, key: &[u8], current: Option<&[u8]>) -> VisitAction {
        let Some(expected) = self.expected.get(key) else {
            return VisitAction::Keep;
        };
        match current {
            None => VisitAction::Set(expected.clone()),
            Some(actual) if actual == &expected[..] => VisitAction::Keep,
            Some(actual) => {
                self.errors.insert(
                    IndexKey::raw(Bytes::copy_from_slice(key)),
                    Bytes::copy_from_slice(actual),
                );
                VisitAction::Keep
            }
        }
    }
}

/// Drops each index key still owned by `owner`
struct RemoveIndex<'a> {
    owner: &'a [u8],
    errors: &'a mut IndexErrors,
}

impl Visitor for RemoveIndex<'_> {
    fn visit(&mut self, key: &[u8], current: Option<&[u8]>) -> VisitAction {
        match current {
            None => VisitAction::Keep,
            Some(actual) if actual == self.owner => VisitAction::Remove,
            Some(actual) => {
                self.errors.insert(
                    IndexKey::raw(Bytes::copy_from_slice(key)),
                    Bytes::copy_from_slice(actual),
                );
                VisitAction::Keep
            }
        }
    }
}

// =============================================================================
// Transaction Scope
// =============================================================================

/// Engine transaction that aborts when dropped without a commit
struct Transaction<'a> {
    store: &'a dyn Store,
    active: bool,
}

impl<'a> Transaction<'a> {
    fn begin(store: &'a dyn Store) -> EngineResult<Self> {
        store.begin_transaction()?;
        Ok(Self {
            store,
            active: true,
        })
    }

    fn commit(mut self) -> EngineResult<()> {
        self.active = false;
        self.store.end_transaction(true)
    }

    fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        // The caller's error is what gets reported; a failed abort is only logged
        if let Err(e) = self.store.end_transaction(false) {
            tracing::warn!(error = %e, "failed to abort transaction");
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback();
    }
}

// =============================================================================
// Indexed Write
// =============================================================================

/// A primary write with the index entries that must change alongside it
///
/// Upserts map each index key to the owner it should point at, which is
/// conventionally the primary key. Removals are only applied to entries
/// still owned by the primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedWrite {
    pub primary: PrimaryWrite,
    pub upserts: BTreeMap<IndexKey, Bytes>,
    pub removals: BTreeSet<IndexKey>,
}

impl IndexedWrite {
    pub fn new(primary: PrimaryWrite) -> Self {
        Self {
            primary,
            upserts: BTreeMap::new(),
            removals: BTreeSet::new(),
        }
    }

    /// Point `index` at `owner`
    pub fn upsert(mut self, index: IndexKey, owner: impl Into<Bytes>) -> Self {
        self.upserts.insert(index, owner.into());
        self
    }

    /// Drop `index` if it still points at the primary key
    pub fn remove_index(mut self, index: IndexKey) -> Self {
        self.removals.insert(index);
        self
    }

    pub fn has_index_work(&self) -> bool {
        !self.upserts.is_empty() || !self.removals.is_empty()
    }

    /// Shape checks, no I/O
    pub fn validate(&self) -> Result<()> {
        let primary = self.primary.key();

        if let Some(both) = self.upserts.keys().find(|k| self.removals.contains(*k)) {
            return Err(AtlasError::InvalidRequest(format!(
                "{:?} is both upserted and removed",
                both
            )));
        }
        let names_primary = self
            .upserts
            .keys()
            .chain(self.removals.iter())
            .any(|k| k.as_bytes() == &primary[..]);
        if names_primary {
            return Err(AtlasError::InvalidRequest(
                "the primary key cannot be used as an index key".to_string(),
            ));
        }
        if matches!(self.primary, PrimaryWrite::Remove { .. }) && !self.upserts.is_empty() {
            return Err(AtlasError::InvalidRequest(
                "a removal cannot upsert index entries".to_string(),
            ));
        }
        Ok(())
    }

    /// Run the write against `store`
    ///
    /// On `IndexConflict` nothing was committed, including the primary write.
    pub fn apply(&self, store: &dyn Store) -> Result<()> {
        if !self.has_index_work() {
            return Ok(self.primary.apply(store)?);
        }

        tracing::trace!(
            op = self.primary.name(),
            upserts = self.upserts.len(),
            removals = self.removals.len(),
            "indexed write"
        );

        let txn = Transaction::begin(store)?;
        self.primary.apply(store)?;

        let mut errors = IndexErrors::new();
        if !self.upserts.is_empty() {
            let keys: Vec<Bytes> = self.upserts.keys().map(IndexKey::to_bytes).collect();
            let mut visitor = ApplyIndex {
                expected: &self.upserts,
                errors: &mut errors,
            };
            store.accept_bulk(&keys, &mut visitor, true)?;
        }
        if !self.removals.is_empty() {
            let keys: Vec<Bytes> = self.removals.iter().map(IndexKey::to_bytes).collect();
            let mut visitor = RemoveIndex {
                owner: self.primary.key(),
                errors: &mut errors,
            };
            store.accept_bulk(&keys, &mut visitor, true)?;
        }

        if !errors.is_empty() {
            tracing::warn!(
                op = self.primary.name(),
                conflicts = errors.len(),
                "index conflict, aborting"
            );
            txn.abort();
            return Err(AtlasError::IndexConflict { errors });
        }

        txn.commit()?;
        Ok(())
    }
}
