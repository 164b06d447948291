//! Database handle
//!
//! The caller-facing asynchronous API. Every operation validates its inputs,
//! hands a [`Descriptor`] to the [`EventLoop`] and returns immediately; the
//! callback receives the typed result later, on the loop thread.
//!
//! ## State
//! ```text
//! Closed ──open──► Opening ──ok──► Open ──close──► Closing ──► Closed
//!                     └──err──► Closed               └──err──► Open
//! ```
//! Data operations are only accepted while `Open`; anything else is
//! rejected synchronously with [`AtlasError::Closed`].

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use regex::bytes::Regex;

use crate::config::Config;
use crate::cursor::Cursor;
use crate::dispatch::{DbOp, Descriptor, EventLoop, Reply, RequestId};
use crate::engine::{MemoryStore, Store};
use crate::error::{AtlasError, Result};
use crate::indexed::{IndexedWrite, PrimaryWrite};
use crate::types::{IndexKey, OpenMode};

fn bytes(data: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(data.as_ref())
}

/// Match limits below zero mean "no limit"
fn limit(max: i64) -> Option<usize> {
    usize::try_from(max).ok()
}

/// Lifecycle of a [`Database`] as seen from the loop thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Asynchronous handle to one store
pub struct Database {
    event_loop: EventLoop,
    store: Arc<dyn Store>,
    state: Rc<Cell<DbState>>,
    /// Bumped each time the store closes; cursors from older generations are stale
    generation: Rc<Cell<u64>>,
}

impl Database {
    /// A database backed by the bundled [`MemoryStore`]
    pub fn new(event_loop: &EventLoop) -> Self {
        Self::with_store(event_loop, Arc::new(MemoryStore::new()))
    }

    /// A database backed by any engine implementing [`Store`]
    ///
    /// The store must not be open yet.
    pub fn with_store(event_loop: &EventLoop, store: Arc<dyn Store>) -> Self {
        Self {
            event_loop: event_loop.clone(),
            store,
            state: Rc::new(Cell::new(DbState::Closed)),
            generation: Rc::new(Cell::new(0)),
        }
    }

    pub fn state(&self) -> DbState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == DbState::Open
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    fn submit<T, F>(&self, op: DbOp, convert: fn(Reply) -> Result<T>, callback: F) -> Result<RequestId>
    where
        T: 'static,
        F: FnOnce(Result<T>) + 'static,
    {
        if !self.is_open() {
            return Err(AtlasError::Closed(op.name()));
        }
        let descriptor = Descriptor::Db {
            op,
            store: Arc::clone(&self.store),
        };
        self.event_loop
            .submit(descriptor, move |reply| callback(reply.and_then(convert)))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open with an fopen-style mode string (`r`, `r+`, `w+`, `a+`)
    pub fn open<F>(&self, path: &str, mode: &str, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let mode: OpenMode = mode.parse()?;
        self.open_mode(path, mode, callback)
    }

    /// Open with the path and mode from `config`
    pub fn open_with<F>(&self, config: &Config, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.open_mode(&config.path, config.open_mode, callback)
    }

    pub fn open_mode<F>(&self, path: &str, mode: OpenMode, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        if self.state.get() != DbState::Closed {
            return Err(AtlasError::InvalidRequest(
                "open: database is already open".to_string(),
            ));
        }

        let descriptor = Descriptor::Db {
            op: DbOp::Open {
                path: path.to_string(),
                mode,
            },
            store: Arc::clone(&self.store),
        };
        let state = Rc::clone(&self.state);
        let id = self.event_loop.submit(descriptor, move |reply| {
            let result = reply.and_then(Reply::into_unit);
            state.set(if result.is_ok() {
                DbState::Open
            } else {
                DbState::Closed
            });
            callback(result)
        })?;

        self.state.set(DbState::Opening);
        Ok(id)
    }

    /// Close the store
    ///
    /// Submit this only after earlier requests have been delivered.
    pub fn close<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        if !self.is_open() {
            return Err(AtlasError::Closed("close"));
        }

        let descriptor = Descriptor::Db {
            op: DbOp::Close,
            store: Arc::clone(&self.store),
        };
        let state = Rc::clone(&self.state);
        let generation = Rc::clone(&self.generation);
        let id = self.event_loop.submit(descriptor, move |reply| {
            let result = reply.and_then(Reply::into_unit);
            if result.is_ok() {
                generation.set(generation.get() + 1);
                state.set(DbState::Closed);
            } else {
                state.set(DbState::Open);
            }
            callback(result)
        })?;

        self.state.set(DbState::Closing);
        Ok(id)
    }

    /// Remove every record
    pub fn clear<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.submit(DbOp::Clear, Reply::into_unit, callback)
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// `None` when the key is absent
    pub fn get<F>(&self, key: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Option<Bytes>>) + 'static,
    {
        self.submit(DbOp::Get { key: bytes(key) }, Reply::into_value, callback)
    }

    pub fn set<F>(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let op = DbOp::Set {
            key: bytes(key),
            value: bytes(value),
        };
        self.submit(op, Reply::into_unit, callback)
    }

    /// Fails with `DuplicateRecord` when the key exists
    pub fn add<F>(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let op = DbOp::Add {
            key: bytes(key),
            value: bytes(value),
        };
        self.submit(op, Reply::into_unit, callback)
    }

    /// Fails with `RecordNotFound` when the key is absent
    pub fn replace<F>(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let op = DbOp::Replace {
            key: bytes(key),
            value: bytes(value),
        };
        self.submit(op, Reply::into_unit, callback)
    }

    pub fn append<F>(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let op = DbOp::Append {
            key: bytes(key),
            value: bytes(value),
        };
        self.submit(op, Reply::into_unit, callback)
    }

    /// Fails with `RecordNotFound` when the key is absent
    pub fn remove<F>(&self, key: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.submit(DbOp::Remove { key: bytes(key) }, Reply::into_unit, callback)
    }

    /// Add `delta`, seeding an absent key with `initial`
    pub fn increment<F>(&self, key: impl AsRef<[u8]>, delta: i64, initial: i64, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<i64>) + 'static,
    {
        let op = DbOp::Increment {
            key: bytes(key),
            delta,
            initial,
        };
        self.submit(op, Reply::into_integer, callback)
    }

    pub fn increment_float<F>(
        &self,
        key: impl AsRef<[u8]>,
        delta: f64,
        initial: f64,
        callback: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(Result<f64>) + 'static,
    {
        let op = DbOp::IncrementFloat {
            key: bytes(key),
            delta,
            initial,
        };
        self.submit(op, Reply::into_float, callback)
    }

    /// `old = None` requires absence, `new = None` removes on match
    ///
    /// A mismatch delivers `Ok(false)`.
    pub fn compare_and_swap<F>(
        &self,
        key: impl AsRef<[u8]>,
        old: Option<&[u8]>,
        new: Option<&[u8]>,
        callback: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        let op = DbOp::CompareAndSwap {
            key: bytes(key),
            old: old.map(Bytes::copy_from_slice),
            new: new.map(Bytes::copy_from_slice),
        };
        self.submit(op, Reply::into_flag, callback)
    }

    // =========================================================================
    // Bulk & Matching
    // =========================================================================

    /// Records that exist among `keys`
    pub fn get_bulk<K, F>(&self, keys: &[K], atomic: bool, callback: F) -> Result<RequestId>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<BTreeMap<Bytes, Bytes>>) + 'static,
    {
        let keys = keys.iter().map(bytes).collect();
        self.submit(DbOp::GetBulk { keys, atomic }, Reply::into_records, callback)
    }

    pub fn set_bulk<F>(&self, items: BTreeMap<Bytes, Bytes>, atomic: bool, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<usize>) + 'static,
    {
        self.submit(DbOp::SetBulk { items, atomic }, Reply::into_count, callback)
    }

    /// Delivers how many of `keys` existed
    pub fn remove_bulk<K, F>(&self, keys: &[K], atomic: bool, callback: F) -> Result<RequestId>
    where
        K: AsRef<[u8]>,
        F: FnOnce(Result<usize>) + 'static,
    {
        let keys = keys.iter().map(bytes).collect();
        self.submit(DbOp::RemoveBulk { keys, atomic }, Reply::into_count, callback)
    }

    /// Keys starting with `prefix` in ascending order, at most `max` (< 0 = all)
    pub fn match_prefix<F>(&self, prefix: impl AsRef<[u8]>, max: i64, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Vec<Bytes>>) + 'static,
    {
        let op = DbOp::MatchPrefix {
            prefix: bytes(prefix),
            max: limit(max),
        };
        self.submit(op, Reply::into_keys, callback)
    }

    /// Keys matching `pattern` in ascending order, at most `max` (< 0 = all)
    pub fn match_regex<F>(&self, pattern: &str, max: i64, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Vec<Bytes>>) + 'static,
    {
        let pattern = Regex::new(pattern)
            .map_err(|e| AtlasError::InvalidRequest(format!("match_regex: {}", e)))?;
        let op = DbOp::MatchRegex {
            pattern,
            max: limit(max),
        };
        self.submit(op, Reply::into_keys, callback)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Persist contents; `hard` also syncs the device
    pub fn synchronize<F>(&self, hard: bool, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.submit(DbOp::Synchronize { hard }, Reply::into_unit, callback)
    }

    pub fn copy<F>(&self, dest: impl AsRef<Path>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let dest = dest.as_ref().to_path_buf();
        self.submit(DbOp::Copy { dest }, Reply::into_unit, callback)
    }

    pub fn dump_snapshot<F>(&self, dest: impl AsRef<Path>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let dest = dest.as_ref().to_path_buf();
        self.submit(DbOp::DumpSnapshot { dest }, Reply::into_unit, callback)
    }

    /// Replace every record with the contents of a snapshot
    pub fn load_snapshot<F>(&self, src: impl AsRef<Path>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let src = src.as_ref().to_path_buf();
        self.submit(DbOp::LoadSnapshot { src }, Reply::into_unit, callback)
    }

    pub fn count<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<u64>) + 'static,
    {
        self.submit(DbOp::Count, Reply::into_size, callback)
    }

    pub fn size<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<u64>) + 'static,
    {
        self.submit(DbOp::Size, Reply::into_size, callback)
    }

    pub fn status<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<BTreeMap<String, String>>) + 'static,
    {
        self.submit(DbOp::Status, Reply::into_status, callback)
    }

    // =========================================================================
    // Indexed Writes
    // =========================================================================

    /// Run a prepared [`IndexedWrite`]
    pub fn write_indexed<F>(&self, write: IndexedWrite, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.submit(DbOp::Indexed(write), Reply::into_unit, callback)
    }

    /// Add a record and point each index key in `upserts` at its owner
    pub fn add_indexed<F>(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        upserts: BTreeMap<IndexKey, Bytes>,
        callback: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let write = IndexedWrite {
            primary: PrimaryWrite::Add {
                key: bytes(key),
                value: bytes(value),
            },
            upserts,
            removals: BTreeSet::new(),
        };
        self.write_indexed(write, callback)
    }

    /// Replace a record, claiming `upserts` and releasing `removals`
    pub fn replace_indexed<F>(
        &self,
        key: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        upserts: BTreeMap<IndexKey, Bytes>,
        removals: BTreeSet<IndexKey>,
        callback: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let write = IndexedWrite {
            primary: PrimaryWrite::Replace {
                key: bytes(key),
                value: bytes(value),
            },
            upserts,
            removals,
        };
        self.write_indexed(write, callback)
    }

    /// Remove a record and release the index keys it owns
    pub fn remove_indexed<F>(
        &self,
        key: impl AsRef<[u8]>,
        removals: BTreeSet<IndexKey>,
        callback: F,
    ) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let write = IndexedWrite {
            primary: PrimaryWrite::Remove { key: bytes(key) },
            upserts: BTreeMap::new(),
            removals,
        };
        self.write_indexed(write, callback)
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// A fresh cursor with no position
    ///
    /// The cursor is bound to the current open; once the database closes it
    /// rejects every request, even after a reopen.
    pub fn cursor(&self) -> Result<Cursor> {
        if !self.is_open() {
            return Err(AtlasError::Closed("cursor"));
        }
        let inner = self.store.cursor()?;
        Ok(Cursor::new(
            self.event_loop.clone(),
            Arc::clone(&self.store),
            Arc::new(Mutex::new(inner)),
            Rc::clone(&self.state),
            Rc::clone(&self.generation),
        ))
    }

    /// Visit every record in key order
    ///
    /// `visit` runs on the loop thread for each record until it breaks or
    /// the records run out; `done` is then called exactly once.
    pub fn each<V, D>(&self, visit: V, done: D) -> Result<RequestId>
    where
        V: FnMut(&[u8], &[u8]) -> ControlFlow<()> + 'static,
        D: FnOnce(Result<()>) + 'static,
    {
        let cursor = self.cursor()?;
        let walk = Rc::new(RefCell::new(Walk {
            visit,
            done: Some(done),
        }));

        let next = cursor.clone();
        cursor.jump(move |jumped| match jumped {
            Ok(true) => walk_next(next, walk),
            Ok(false) => finish(&walk, Ok(())),
            Err(e) => finish(&walk, Err(e)),
        })
    }
}

// -----------------------------------------------------------------------------
// `each` support
// -----------------------------------------------------------------------------

struct Walk<V, D> {
    visit: V,
    done: Option<D>,
}

fn finish<V, D>(walk: &Rc<RefCell<Walk<V, D>>>, result: Result<()>)
where
    D: FnOnce(Result<()>),
{
    let done = walk.borrow_mut().done.take();
    if let Some(done) = done {
        done(result);
    }
}

fn walk_next<V, D>(cursor: Cursor, walk: Rc<RefCell<Walk<V, D>>>)
where
    V: FnMut(&[u8], &[u8]) -> ControlFlow<()> + 'static,
    D: FnOnce(Result<()>) + 'static,
{
    let next = cursor.clone();
    let shared = Rc::clone(&walk);
    let submitted = cursor.get(true, move |record| {
        let (key, value) = match record {
            Ok(Some(record)) => record,
            Ok(None) => return finish(&shared, Ok(())),
            Err(e) => return finish(&shared, Err(e)),
        };
        let flow = (shared.borrow_mut().visit)(&key[..], &value[..]);
        match flow {
            ControlFlow::Continue(()) => walk_next(next, shared),
            ControlFlow::Break(()) => finish(&shared, Ok(())),
        }
    });

    if let Err(e) = submitted {
        finish(&walk, Err(e));
    }
}
