//! In-memory reference engine
//!
//! BTreeMap-based ordered store with RwLock for concurrency, optionally
//! backed by a snapshot file.
//!
//! ## Concurrency Model
//! - Reads take the records read lock only
//! - Writes take the transaction mutex, then the records write lock
//! - One transaction at a time, owned by the thread that began it.
//!   Mutations from other threads wait until it ends; reads do not.
//! - Aborting restores the original value of every key touched since
//!   `begin_transaction` from the undo log.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use regex::bytes::Regex;

use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::types::OpenMode;

use super::cursor::MemoryCursor;
use super::snapshot;
use super::{Store, StoreCursor, VisitAction, Visitor};

// =============================================================================
// Records
// =============================================================================

/// Ordered records with running size accounting
#[derive(Default)]
pub(crate) struct Records {
    pub(crate) map: BTreeMap<Bytes, Bytes>,
    bytes: u64,
}

impl Records {
    fn from_map(map: BTreeMap<Bytes, Bytes>) -> Self {
        let bytes = map.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum();
        Self { map, bytes }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.map.get(key)
    }

    fn insert(&mut self, key: Bytes, value: Bytes) -> Option<Bytes> {
        let added = (key.len() + value.len()) as u64;
        let old = self.map.insert(key.clone(), value);
        if let Some(old) = &old {
            self.bytes -= (key.len() + old.len()) as u64;
        }
        self.bytes += added;
        old
    }

    fn remove(&mut self, key: &[u8]) -> Option<Bytes> {
        let old = self.map.remove(key);
        if let Some(old) = &old {
            self.bytes -= (key.len() + old.len()) as u64;
        }
        old
    }

    fn clear(&mut self) {
        self.map.clear();
        self.bytes = 0;
    }

    /// First record with key > `key`
    pub(crate) fn after(&self, key: &[u8]) -> Option<(&Bytes, &Bytes)> {
        self.map
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
    }

    /// First record with key >= `key`
    pub(crate) fn at_or_after(&self, key: &[u8]) -> Option<(&Bytes, &Bytes)> {
        self.map
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .next()
    }

    /// Last record with key < `key`
    pub(crate) fn before(&self, key: &[u8]) -> Option<(&Bytes, &Bytes)> {
        self.map
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
    }

    /// Last record with key <= `key`
    pub(crate) fn at_or_before(&self, key: &[u8]) -> Option<(&Bytes, &Bytes)> {
        self.map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
    }

    pub(crate) fn first(&self) -> Option<(&Bytes, &Bytes)> {
        self.map.iter().next()
    }

    pub(crate) fn last(&self) -> Option<(&Bytes, &Bytes)> {
        self.map.iter().next_back()
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Default)]
struct TxnState {
    /// Thread that began the running transaction
    owner: Option<ThreadId>,
    /// Original value of each key, recorded on first touch
    undo: Vec<(Bytes, Option<Bytes>)>,
    touched: HashSet<Bytes>,
}

impl TxnState {
    fn reset(&mut self) {
        self.undo.clear();
        self.touched.clear();
    }
}

/// Mutable view of the records for one write call
///
/// Every mutation goes through here so that the running transaction (if
/// this thread owns one) can record the original value first.
pub(crate) struct WriteScope<'a> {
    records: &'a mut Records,
    txn: Option<&'a mut TxnState>,
}

impl WriteScope<'_> {
    pub(crate) fn records(&self) -> &Records {
        &*self.records
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<&Bytes> {
        self.records.get(key)
    }

    pub(crate) fn insert(&mut self, key: Bytes, value: Bytes) -> Option<Bytes> {
        self.remember(&key);
        self.records.insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &[u8]) -> Option<Bytes> {
        if !self.records.map.contains_key(key) {
            return None;
        }
        self.remember(key);
        self.records.remove(key)
    }

    fn clear(&mut self) {
        if self.txn.is_some() {
            let keys: Vec<Bytes> = self.records.map.keys().cloned().collect();
            for key in keys {
                self.remember(&key);
            }
        }
        self.records.clear();
    }

    fn remember(&mut self, key: &[u8]) {
        if let Some(txn) = self.txn.as_deref_mut() {
            let key = Bytes::copy_from_slice(key);
            if txn.touched.insert(key.clone()) {
                let original = self.records.map.get(&key).cloned();
                txn.undo.push((key, original));
            }
        }
    }
}

// =============================================================================
// Open State
// =============================================================================

#[derive(Debug, Clone)]
enum Backing {
    Memory,
    Snapshot(PathBuf),
}

impl Backing {
    fn from_path(path: &str) -> Self {
        match path {
            "-" | "+" | ":memory:" => Backing::Memory,
            other => Backing::Snapshot(PathBuf::from(other)),
        }
    }
}

#[derive(Debug, Clone)]
struct OpenState {
    path: String,
    mode: OpenMode,
    backing: Backing,
}

// =============================================================================
// Store Core (shared with cursors)
// =============================================================================

pub(crate) struct StoreCore {
    records: RwLock<Records>,
    txn: Mutex<TxnState>,
    txn_ended: Condvar,
    state: RwLock<Option<OpenState>>,
}

impl StoreCore {
    fn new() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            txn: Mutex::new(TxnState::default()),
            txn_ended: Condvar::new(),
            state: RwLock::new(None),
        }
    }

    fn opened(&self) -> EngineResult<OpenState> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| EngineError::new(ErrorKind::InvalidInput, "not opened"))
    }

    fn writable(&self) -> EngineResult<OpenState> {
        let state = self.opened()?;
        if !state.mode.is_writable() {
            return Err(EngineError::new(
                ErrorKind::PermissionDenied,
                "opened as a reader",
            ));
        }
        Ok(state)
    }

    /// Run `f` against the records under the read lock
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Records) -> R) -> EngineResult<R> {
        self.opened()?;
        let records = self.records.read();
        Ok(f(&records))
    }

    /// Run `f` as one atomic mutation
    ///
    /// Waits while another thread owns a transaction. Inside this thread's
    /// own transaction, touched keys are journaled for rollback.
    pub(crate) fn write<R>(
        &self,
        f: impl FnOnce(&mut WriteScope<'_>) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let state = self.writable()?;
        let me = thread::current().id();

        let mut txn = self.txn.lock();
        while matches!(txn.owner, Some(owner) if owner != me) {
            self.txn_ended.wait(&mut txn);
        }
        let in_txn = txn.owner == Some(me);

        let result = {
            let mut records = self.records.write();
            let mut scope = WriteScope {
                records: &mut records,
                txn: if in_txn { Some(&mut *txn) } else { None },
            };
            f(&mut scope)
        };
        drop(txn);

        if result.is_ok() && !in_txn && state.mode.contains(OpenMode::AUTO_SYNC) {
            self.auto_sync(&state);
        }
        result
    }

    /// Best-effort persist after a mutation that is already visible
    fn auto_sync(&self, state: &OpenState) {
        if let Err(e) = self.persist(state, false) {
            tracing::warn!(path = %state.path, error = %e, "auto sync failed");
        }
    }

    /// Write contents to the backing snapshot, if any
    fn persist(&self, state: &OpenState, hard: bool) -> EngineResult<()> {
        match &state.backing {
            Backing::Memory => Ok(()),
            Backing::Snapshot(path) => {
                let records = self.records.read();
                snapshot::write(path, &records.map, hard)
            }
        }
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// Ordered in-memory engine implementing the full [`Store`] contract
///
/// Paths `"-"`, `"+"` and `":memory:"` are memory only. Any other path is
/// a snapshot file loaded at open and written on close/synchronize.
#[derive(Clone)]
pub struct MemoryStore {
    core: Arc<StoreCore>,
}

impl MemoryStore {
    /// Create an unopened store
    pub fn new() -> Self {
        Self {
            core: Arc::new(StoreCore::new()),
        }
    }

    /// Create a store already opened as a writable in-memory tree
    pub fn open_in_memory() -> EngineResult<Self> {
        let store = Self::new();
        store.open("+", OpenMode::WRITER | OpenMode::CREATE)?;
        Ok(store)
    }

    fn load_initial(path: &Path, mode: OpenMode) -> EngineResult<(BTreeMap<Bytes, Bytes>, bool)> {
        let writable = mode.is_writable();
        if writable && mode.contains(OpenMode::TRUNCATE) {
            return Ok((BTreeMap::new(), true));
        }
        if path.exists() {
            return Ok((snapshot::read(path)?, false));
        }
        if writable && mode.contains(OpenMode::CREATE) {
            return Ok((BTreeMap::new(), true));
        }
        Err(EngineError::new(
            ErrorKind::RepositoryMissing,
            format!("{} does not exist", path.display()),
        ))
    }

    fn write_value<F>(&self, key: &[u8], value: &[u8], f: F) -> EngineResult<()>
    where
        F: FnOnce(Option<&Bytes>, &[u8]) -> EngineResult<Bytes>,
    {
        self.core.write(|scope| {
            let next = f(scope.get(key), value)?;
            scope.insert(Bytes::copy_from_slice(key), next);
            Ok(())
        })
    }

    fn matching<P>(&self, max: Option<usize>, mut pred: P) -> EngineResult<Vec<Bytes>>
    where
        P: FnMut(&[u8]) -> bool,
    {
        self.core.read(|records| {
            records
                .map
                .keys()
                .filter(|k| pred(k))
                .take(max.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_i64(value: &[u8]) -> EngineResult<i64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        EngineError::new(ErrorKind::LogicConflict, "existing record was not compatible")
    })?;
    Ok(i64::from_be_bytes(bytes))
}

fn decode_f64(value: &[u8]) -> EngineResult<f64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        EngineError::new(ErrorKind::LogicConflict, "existing record was not compatible")
    })?;
    Ok(f64::from_bits(u64::from_be_bytes(bytes)))
}

impl Store for MemoryStore {
    fn open(&self, path: &str, mode: OpenMode) -> EngineResult<()> {
        let mut state = self.core.state.write();
        if state.is_some() {
            return Err(EngineError::new(ErrorKind::InvalidInput, "already opened"));
        }
        if !mode.contains(OpenMode::READER) && !mode.contains(OpenMode::WRITER) {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                "mode must include READER or WRITER",
            ));
        }

        let backing = Backing::from_path(path);
        let (map, fresh) = match &backing {
            Backing::Memory => (BTreeMap::new(), false),
            Backing::Snapshot(file) => Self::load_initial(file, mode)?,
        };
        if let (true, Backing::Snapshot(file)) = (fresh, &backing) {
            snapshot::write(file, &map, false)?;
        }

        tracing::debug!(path, records = map.len(), "store opened");
        *self.core.records.write() = Records::from_map(map);
        *state = Some(OpenState {
            path: path.to_string(),
            mode,
            backing,
        });
        Ok(())
    }

    fn close(&self) -> EngineResult<()> {
        let mut state = self.core.state.write();
        let open = state
            .take()
            .ok_or_else(|| EngineError::new(ErrorKind::InvalidInput, "not opened"))?;

        let persisted = if open.mode.is_writable() {
            self.core.persist(&open, false)
        } else {
            Ok(())
        };
        self.core.records.write().clear();
        tracing::debug!(path = %open.path, "store closed");
        persisted
    }

    fn clear(&self) -> EngineResult<()> {
        self.core.write(|scope| {
            scope.clear();
            Ok(())
        })
    }

    fn get(&self, key: &[u8]) -> EngineResult<Bytes> {
        self.core
            .read(|records| records.get(key).cloned())?
            .ok_or_else(|| EngineError::not_found("no record"))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_value(key, value, |_, value| Ok(Bytes::copy_from_slice(value)))
    }

    fn add(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_value(key, value, |current, value| match current {
            Some(_) => Err(EngineError::new(
                ErrorKind::DuplicateRecord,
                "record duplication",
            )),
            None => Ok(Bytes::copy_from_slice(value)),
        })
    }

    fn replace(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_value(key, value, |current, value| match current {
            Some(_) => Ok(Bytes::copy_from_slice(value)),
            None => Err(EngineError::not_found("no record")),
        })
    }

    fn append(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.write_value(key, value, |current, value| {
            let mut joined = current.map(|c| c.to_vec()).unwrap_or_default();
            joined.extend_from_slice(value);
            Ok(Bytes::from(joined))
        })
    }

    fn remove(&self, key: &[u8]) -> EngineResult<()> {
        self.core.write(|scope| {
            scope
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| EngineError::not_found("no record"))
        })
    }

    fn increment(&self, key: &[u8], delta: i64, initial: i64) -> EngineResult<i64> {
        self.core.write(|scope| {
            let base = match scope.get(key) {
                Some(current) => decode_i64(current)?,
                None => initial,
            };
            let next = base.checked_add(delta).ok_or_else(|| {
                EngineError::new(ErrorKind::LogicConflict, "integer overflow")
            })?;
            scope.insert(
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(&next.to_be_bytes()),
            );
            Ok(next)
        })
    }

    fn increment_float(&self, key: &[u8], delta: f64, initial: f64) -> EngineResult<f64> {
        self.core.write(|scope| {
            let base = match scope.get(key) {
                Some(current) => decode_f64(current)?,
                None => initial,
            };
            let next = base + delta;
            if !next.is_finite() {
                return Err(EngineError::new(
                    ErrorKind::LogicConflict,
                    "result is not finite",
                ));
            }
            scope.insert(
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(&next.to_bits().to_be_bytes()),
            );
            Ok(next)
        })
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> EngineResult<bool> {
        self.core.write(|scope| {
            if scope.get(key).map(|v| &v[..]) != old {
                return Ok(false);
            }
            match new {
                Some(value) => {
                    scope.insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
                }
                None => {
                    scope.remove(key);
                }
            }
            Ok(true)
        })
    }

    fn get_bulk(&self, keys: &[Bytes], atomic: bool) -> EngineResult<BTreeMap<Bytes, Bytes>> {
        let mut found = BTreeMap::new();
        if atomic {
            self.core.read(|records| {
                for key in keys {
                    if let Some(value) = records.get(key) {
                        found.insert(key.clone(), value.clone());
                    }
                }
            })?;
        } else {
            for key in keys {
                if let Some(value) = self.core.read(|records| records.get(key).cloned())? {
                    found.insert(key.clone(), value);
                }
            }
        }
        Ok(found)
    }

    fn set_bulk(&self, items: &BTreeMap<Bytes, Bytes>, atomic: bool) -> EngineResult<usize> {
        if atomic {
            return self.core.write(|scope| {
                for (key, value) in items {
                    scope.insert(key.clone(), value.clone());
                }
                Ok(items.len())
            });
        }
        for (key, value) in items {
            self.core.write(|scope| {
                scope.insert(key.clone(), value.clone());
                Ok(())
            })?;
        }
        Ok(items.len())
    }

    fn remove_bulk(&self, keys: &[Bytes], atomic: bool) -> EngineResult<usize> {
        if atomic {
            return self.core.write(|scope| {
                Ok(keys.iter().filter(|k| scope.remove(k).is_some()).count())
            });
        }
        let mut removed = 0;
        for key in keys {
            if self.core.write(|scope| Ok(scope.remove(key).is_some()))? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn match_prefix(&self, prefix: &[u8], max: Option<usize>) -> EngineResult<Vec<Bytes>> {
        self.core.read(|records| {
            records
                .map
                .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                .map(|(k, _)| k)
                .take_while(|k| k.starts_with(prefix))
                .take(max.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })
    }

    fn match_regex(&self, pattern: &Regex, max: Option<usize>) -> EngineResult<Vec<Bytes>> {
        self.matching(max, |key| pattern.is_match(key))
    }

    fn begin_transaction(&self) -> EngineResult<()> {
        self.core.writable()?;
        let me = thread::current().id();
        let mut txn = self.core.txn.lock();
        loop {
            match txn.owner {
                None => break,
                Some(owner) if owner == me => {
                    return Err(EngineError::new(
                        ErrorKind::LogicConflict,
                        "transaction already in progress",
                    ));
                }
                Some(_) => self.core.txn_ended.wait(&mut txn),
            }
        }
        txn.owner = Some(me);
        txn.reset();
        tracing::trace!("transaction begun");
        Ok(())
    }

    fn end_transaction(&self, commit: bool) -> EngineResult<()> {
        let me = thread::current().id();
        let mut txn = self.core.txn.lock();
        if txn.owner != Some(me) {
            return Err(EngineError::new(
                ErrorKind::InvalidInput,
                "not in transaction",
            ));
        }

        if !commit {
            let mut records = self.core.records.write();
            for (key, original) in txn.undo.drain(..).rev() {
                match original {
                    Some(value) => {
                        records.insert(key, value);
                    }
                    None => {
                        records.remove(&key);
                    }
                }
            }
        }
        txn.reset();
        txn.owner = None;
        drop(txn);
        self.core.txn_ended.notify_all();
        tracing::trace!(commit, "transaction ended");

        if commit {
            if let Ok(state) = self.core.opened() {
                if state.mode.contains(OpenMode::AUTO_SYNC) {
                    self.core.auto_sync(&state);
                }
            }
        }
        Ok(())
    }

    fn accept_bulk(
        &self,
        keys: &[Bytes],
        visitor: &mut dyn Visitor,
        writable: bool,
    ) -> EngineResult<usize> {
        if !writable {
            return self.core.read(|records| {
                for key in keys {
                    let action = visitor.visit(key, records.get(key).map(|v| &v[..]));
                    if action != VisitAction::Keep {
                        return Err(EngineError::new(
                            ErrorKind::PermissionDenied,
                            "visitor mutated a read-only visit",
                        ));
                    }
                }
                Ok(keys.len())
            })?;
        }

        self.core.write(|scope| {
            for key in keys {
                let current = scope.get(key).cloned();
                match visitor.visit(key, current.as_deref()) {
                    VisitAction::Keep => {}
                    VisitAction::Set(value) => {
                        scope.insert(key.clone(), value);
                    }
                    VisitAction::Remove => {
                        scope.remove(key);
                    }
                }
            }
            Ok(keys.len())
        })
    }

    fn synchronize(&self, hard: bool) -> EngineResult<()> {
        let state = self.core.opened()?;
        self.core.persist(&state, hard)
    }

    fn copy(&self, dest: &Path) -> EngineResult<()> {
        let state = self.core.opened()?;
        match &state.backing {
            Backing::Snapshot(path) => {
                if state.mode.is_writable() {
                    self.core.persist(&state, false)?;
                }
                fs::copy(path, dest)?;
                Ok(())
            }
            Backing::Memory => self.dump_snapshot(dest),
        }
    }

    fn dump_snapshot(&self, dest: &Path) -> EngineResult<()> {
        self.core.opened()?;
        let records = self.core.records.read();
        snapshot::write(dest, &records.map, false)
    }

    fn load_snapshot(&self, src: &Path) -> EngineResult<()> {
        let loaded = snapshot::read(src)?;
        self.core.write(|scope| {
            scope.clear();
            for (key, value) in loaded {
                scope.insert(key, value);
            }
            Ok(())
        })
    }

    fn count(&self) -> EngineResult<u64> {
        self.core.read(|records| records.map.len() as u64)
    }

    fn size(&self) -> EngineResult<u64> {
        self.core.read(|records| records.bytes)
    }

    fn status(&self) -> EngineResult<BTreeMap<String, String>> {
        let state = self.core.opened()?;
        let in_transaction = self.core.txn.lock().owner.is_some();
        let (count, size) = self
            .core
            .read(|records| (records.map.len(), records.bytes))?;

        let kind = match state.backing {
            Backing::Memory => "memory tree",
            Backing::Snapshot(_) => "snapshot tree",
        };

        let mut status = BTreeMap::new();
        status.insert("count".to_string(), count.to_string());
        status.insert("size".to_string(), size.to_string());
        status.insert("path".to_string(), state.path);
        status.insert("type".to_string(), kind.to_string());
        status.insert("mode".to_string(), state.mode.bits().to_string());
        status.insert("in_transaction".to_string(), in_transaction.to_string());
        Ok(status)
    }

    fn cursor(&self) -> EngineResult<Box<dyn StoreCursor>> {
        self.core.opened()?;
        Ok(Box::new(MemoryCursor::new(Arc::clone(&self.core))))
    }
}
