//! Asynchronous cursor
//!
//! Wraps a [`StoreCursor`](crate::engine::StoreCursor) so every move and
//! read runs through the event loop like any other request. "No record" is
//! never an error here: moves report `false`, reads report `None`.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;

use crate::database::DbState;
use crate::dispatch::{CursorOp, Descriptor, EventLoop, Reply, RequestId, SharedCursor};
use crate::engine::Store;
use crate::error::{AtlasError, Result};

/// A position in one database's key order
///
/// Clones share the same position. A cursor is invalidated when its
/// database closes.
#[derive(Clone)]
pub struct Cursor {
    event_loop: EventLoop,
    store: Arc<dyn Store>,
    inner: SharedCursor,
    db_state: Rc<Cell<DbState>>,
    db_generation: Rc<Cell<u64>>,
    generation: u64,
}

impl Cursor {
    pub(crate) fn new(
        event_loop: EventLoop,
        store: Arc<dyn Store>,
        inner: SharedCursor,
        db_state: Rc<Cell<DbState>>,
        db_generation: Rc<Cell<u64>>,
    ) -> Self {
        let generation = db_generation.get();
        Self {
            event_loop,
            store,
            inner,
            db_state,
            db_generation,
            generation,
        }
    }

    /// Whether the database is still in the open this cursor was created under
    pub fn is_valid(&self) -> bool {
        self.db_state.get() == DbState::Open && self.db_generation.get() == self.generation
    }

    fn submit<T, F>(&self, op: CursorOp, convert: fn(Reply) -> Result<T>, callback: F) -> Result<RequestId>
    where
        T: 'static,
        F: FnOnce(Result<T>) + 'static,
    {
        if !self.is_valid() {
            return Err(AtlasError::Closed(op.name()));
        }
        let descriptor = Descriptor::Cursor {
            op,
            store: Arc::clone(&self.store),
            cursor: Arc::clone(&self.inner),
        };
        self.event_loop
            .submit(descriptor, move |reply| callback(reply.and_then(convert)))
    }

    // -------------------------------------------------------------------------
    // Movement
    // -------------------------------------------------------------------------

    /// Move to the first record
    pub fn jump<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        self.submit(CursorOp::Jump, Reply::into_flag, callback)
    }

    /// Move to the first record with key >= `key`
    pub fn jump_to<F>(&self, key: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        let key = Bytes::copy_from_slice(key.as_ref());
        self.submit(CursorOp::JumpTo { key }, Reply::into_flag, callback)
    }

    /// Move to the last record
    pub fn jump_back<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        self.submit(CursorOp::JumpBack, Reply::into_flag, callback)
    }

    /// Move to the last record with key <= `key`
    pub fn jump_back_to<F>(&self, key: impl AsRef<[u8]>, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        let key = Bytes::copy_from_slice(key.as_ref());
        self.submit(CursorOp::JumpBackTo { key }, Reply::into_flag, callback)
    }

    /// `false` once the cursor runs off the end
    pub fn step<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        self.submit(CursorOp::Step, Reply::into_flag, callback)
    }

    pub fn step_back<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<bool>) + 'static,
    {
        self.submit(CursorOp::StepBack, Reply::into_flag, callback)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Current record, then step forward if `step`
    pub fn get<F>(&self, step: bool, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Option<(Bytes, Bytes)>>) + 'static,
    {
        self.submit(CursorOp::Get { step }, Reply::into_record, callback)
    }

    pub fn get_key<F>(&self, step: bool, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Option<Bytes>>) + 'static,
    {
        self.submit(CursorOp::GetKey { step }, Reply::into_value, callback)
    }

    pub fn get_value<F>(&self, step: bool, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Option<Bytes>>) + 'static,
    {
        self.submit(CursorOp::GetValue { step }, Reply::into_value, callback)
    }

    /// Up to `count` keys from the current position onward
    ///
    /// Stops early at the end of the keyspace; the partial block is returned.
    pub fn get_key_block<F>(&self, count: usize, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Vec<Bytes>>) + 'static,
    {
        self.submit(CursorOp::GetKeyBlock { count }, Reply::into_keys, callback)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn set_value<F>(&self, value: impl AsRef<[u8]>, step: bool, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let value = Bytes::copy_from_slice(value.as_ref());
        self.submit(CursorOp::SetValue { value, step }, Reply::into_unit, callback)
    }

    /// Remove the current record and move to the next one
    pub fn remove<F>(&self, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<()>) + 'static,
    {
        self.submit(CursorOp::Remove, Reply::into_unit, callback)
    }
}
