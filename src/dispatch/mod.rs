//! Async Request Lifecycle
//!
//! Runs store operations on a worker pool and delivers their results back
//! on the thread that owns the [`EventLoop`].
//!
//! ## Lifecycle
//! ```text
//!   submit ──validate──► rejected (Err returned, callback dropped)
//!     │
//!     ▼
//!   pending[id] = callback ──► job queue ──► worker: execute once
//!                                                  │
//!   run / run_once / poll ◄── completion queue ◄───┘
//!     │
//!     ▼
//!   callback(outcome) exactly once, then descriptor released
//! ```
//!
//! Callbacks never run on a worker. Results arrive in completion order,
//! not submission order. A callback that panics takes the loop down with
//! it: the panic is logged and re-raised from `run`/`run_once`/`poll`.

mod pool;
mod request;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crossbeam::channel::{self, Receiver, TryRecvError};

use crate::config::Config;
use crate::error::{AtlasError, Result};

use pool::{Completion, Job, WorkerPool};

pub use request::{CursorOp, DbOp, Descriptor, Reply, SharedCursor};

/// Identifies one submitted request
pub type RequestId = u64;

type Callback = Box<dyn FnOnce(Result<Reply>)>;

struct LoopInner {
    config: Config,
    pending: RefCell<HashMap<RequestId, Callback>>,
    next_id: Cell<RequestId>,
    completions: Receiver<Completion>,
    // Declared last so workers are joined after everything else is dropped
    pool: WorkerPool,
}

/// The originating execution context
///
/// Cheap to clone; clones share one worker pool and one pending table.
/// Not `Send`: results are always delivered on the thread that owns it.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Start an event loop with its worker pool
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let (done, completions) = channel::unbounded();
        let pool = WorkerPool::spawn(&config, done)?;

        Ok(Self {
            inner: Rc::new(LoopInner {
                config,
                pending: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                completions,
                pool,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Requests submitted and not yet delivered
    pub fn in_flight(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Validate and schedule `descriptor`
    ///
    /// On `Err` nothing was scheduled and `callback` will never run.
    /// Otherwise `callback` runs exactly once, on this thread, from a later
    /// call to `run`, `run_once` or `poll`.
    pub fn submit<F>(&self, descriptor: Descriptor, callback: F) -> Result<RequestId>
    where
        F: FnOnce(Result<Reply>) + 'static,
    {
        descriptor.validate(&self.inner.config)?;

        if let Some(capacity) = self.inner.config.queue_capacity {
            if self.in_flight() >= capacity {
                return Err(AtlasError::QueueFull);
            }
        }

        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        let op = descriptor.name();

        self.inner
            .pending
            .borrow_mut()
            .insert(id, Box::new(callback));
        if let Err(e) = self.inner.pool.submit(Job { id, descriptor }) {
            self.inner.pending.borrow_mut().remove(&id);
            return Err(e);
        }

        tracing::debug!(id, op, "request submitted");
        Ok(id)
    }

    /// Deliver until nothing is in flight, returning the number delivered
    ///
    /// Requests submitted by callbacks are waited for too.
    pub fn run(&self) -> usize {
        let mut delivered = 0;
        while self.run_once() {
            delivered += 1;
        }
        delivered
    }

    /// Block for the next completion and deliver it
    ///
    /// Returns `false` without blocking when nothing is in flight.
    pub fn run_once(&self) -> bool {
        if self.in_flight() == 0 {
            return false;
        }
        match self.inner.completions.recv() {
            Ok(completion) => {
                self.deliver(completion);
                true
            }
            Err(_) => {
                self.abandon();
                false
            }
        }
    }

    /// Deliver every completion that is already available, without blocking
    pub fn poll(&self) -> usize {
        let mut delivered = 0;
        loop {
            match self.inner.completions.try_recv() {
                Ok(completion) => {
                    self.deliver(completion);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) => return delivered,
                Err(TryRecvError::Disconnected) => {
                    self.abandon();
                    return delivered;
                }
            }
        }
    }

    fn deliver(&self, completion: Completion) {
        let Completion {
            id,
            outcome,
            descriptor,
        } = completion;
        // Released after the callback returns, or while unwinding out of it
        let pinned = descriptor;

        let callback = self.inner.pending.borrow_mut().remove(&id);
        let Some(callback) = callback else {
            tracing::warn!(id, "completion for unknown request");
            return;
        };

        tracing::debug!(id, op = pinned.name(), ok = outcome.is_ok(), "delivering");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))) {
            tracing::error!(id, op = pinned.name(), "completion callback panicked");
            panic::resume_unwind(payload);
        }
    }

    /// Fail every pending request once the workers are unreachable
    fn abandon(&self) {
        let pending: Vec<(RequestId, Callback)> =
            self.inner.pending.borrow_mut().drain().collect();
        for (id, callback) in pending {
            tracing::warn!(id, "worker pool disconnected");
            callback(Err(AtlasError::Disconnected));
        }
    }
}
