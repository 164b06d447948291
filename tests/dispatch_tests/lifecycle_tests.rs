//! Request Lifecycle Tests
//!
//! Tests verify:
//! - Exactly-once delivery on the loop thread
//! - Synchronous rejection of invalid or closed-database requests
//! - Store references released after delivery, including on panics
//! - Engine panics delivered as errors, callback panics re-raised
//! - Concurrent independent writes

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use atlascab::engine::StoreCursor;
use atlascab::error::{EngineResult, ErrorKind};
use atlascab::{
    AtlasError, Config, Database, DbState, EventLoop, MemoryStore, OpenMode, Store, Visitor,
};
use bytes::Bytes;
use regex::bytes::Regex;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_loop(workers: usize) -> EventLoop {
    EventLoop::new(Config::builder().worker_threads(workers).build()).unwrap()
}

fn open_database(event_loop: &EventLoop) -> Database {
    let db = Database::new(event_loop);
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();
    assert!(db.is_open());
    db
}

/// Shared slot a callback can fill from the loop thread
fn slot<T>() -> (Rc<RefCell<Option<T>>>, Rc<RefCell<Option<T>>>) {
    let slot = Rc::new(RefCell::new(None));
    (Rc::clone(&slot), slot)
}

/// Delegates to a MemoryStore, but panics on `get`
struct PanickyStore {
    inner: MemoryStore,
}

impl Store for PanickyStore {
    fn open(&self, path: &str, mode: OpenMode) -> EngineResult<()> {
        self.inner.open(path, mode)
    }
    fn close(&self) -> EngineResult<()> {
        self.inner.close()
    }
    fn clear(&self) -> EngineResult<()> {
        self.inner.clear()
    }
    fn get(&self, _key: &[u8]) -> EngineResult<Bytes> {
        panic!("engine blew up")
    }
    fn set(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.inner.set(key, value)
    }
    fn add(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.inner.add(key, value)
    }
    fn replace(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.inner.replace(key, value)
    }
    fn append(&self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.inner.append(key, value)
    }
    fn remove(&self, key: &[u8]) -> EngineResult<()> {
        self.inner.remove(key)
    }
    fn increment(&self, key: &[u8], delta: i64, initial: i64) -> EngineResult<i64> {
        self.inner.increment(key, delta, initial)
    }
    fn increment_float(&self, key: &[u8], delta: f64, initial: f64) -> EngineResult<f64> {
        self.inner.increment_float(key, delta, initial)
    }
    fn compare_and_swap(
        &self,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> EngineResult<bool> {
        self.inner.compare_and_swap(key, old, new)
    }
    fn get_bulk(&self, keys: &[Bytes], atomic: bool) -> EngineResult<BTreeMap<Bytes, Bytes>> {
        self.inner.get_bulk(keys, atomic)
    }
    fn set_bulk(&self, items: &BTreeMap<Bytes, Bytes>, atomic: bool) -> EngineResult<usize> {
        self.inner.set_bulk(items, atomic)
    }
    fn remove_bulk(&self, keys: &[Bytes], atomic: bool) -> EngineResult<usize> {
        self.inner.remove_bulk(keys, atomic)
    }
    fn match_prefix(&self, prefix: &[u8], max: Option<usize>) -> EngineResult<Vec<Bytes>> {
        self.inner.match_prefix(prefix, max)
    }
    fn match_regex(&self, pattern: &Regex, max: Option<usize>) -> EngineResult<Vec<Bytes>> {
        self.inner.match_regex(pattern, max)
    }
    fn begin_transaction(&self) -> EngineResult<()> {
        self.inner.begin_transaction()
    }
    fn end_transaction(&self, commit: bool) -> EngineResult<()> {
        self.inner.end_transaction(commit)
    }
    fn accept_bulk(
        &self,
        keys: &[Bytes],
        visitor: &mut dyn Visitor,
        writable: bool,
    ) -> EngineResult<usize> {
        self.inner.accept_bulk(keys, visitor, writable)
    }
    fn synchronize(&self, hard: bool) -> EngineResult<()> {
        self.inner.synchronize(hard)
    }
    fn copy(&self, dest: &Path) -> EngineResult<()> {
        self.inner.copy(dest)
    }
    fn dump_snapshot(&self, dest: &Path) -> EngineResult<()> {
        self.inner.dump_snapshot(dest)
    }
    fn load_snapshot(&self, src: &Path) -> EngineResult<()> {
        self.inner.load_snapshot(src)
    }
    fn count(&self) -> EngineResult<u64> {
        self.inner.count()
    }
    fn size(&self) -> EngineResult<u64> {
        self.inner.size()
    }
    fn status(&self) -> EngineResult<BTreeMap<String, String>> {
        self.inner.status()
    }
    fn cursor(&self) -> EngineResult<Box<dyn StoreCursor>> {
        self.inner.cursor()
    }
}

// =============================================================================
// Delivery Tests
// =============================================================================

#[test]
fn test_each_request_delivered_exactly_once() {
    let event_loop = setup_loop(4);
    let db = open_database(&event_loop);
    let deliveries = Rc::new(Cell::new(0));

    for i in 0..100 {
        let deliveries = Rc::clone(&deliveries);
        db.set(format!("key{}", i), "v", move |stored| {
            stored.unwrap();
            deliveries.set(deliveries.get() + 1);
        })
        .unwrap();
    }

    assert_eq!(event_loop.in_flight(), 100);
    assert_eq!(event_loop.run(), 100);
    assert_eq!(deliveries.get(), 100);
    assert_eq!(event_loop.in_flight(), 0);
}

#[test]
fn test_concurrent_sets_all_observable() {
    let event_loop = setup_loop(8);
    let db = open_database(&event_loop);

    for i in 0..64 {
        db.set(format!("k{:02}", i), format!("v{}", i), |stored| stored.unwrap())
            .unwrap();
    }
    event_loop.run();

    let (sink, found) = slot();
    let keys: Vec<String> = (0..64).map(|i| format!("k{:02}", i)).collect();
    db.get_bulk(&keys, true, move |records| {
        *sink.borrow_mut() = Some(records.unwrap())
    })
    .unwrap();
    event_loop.run();

    let records = found.borrow_mut().take().unwrap();
    assert_eq!(records.len(), 64);
    assert_eq!(records[&Bytes::from("k07")], Bytes::from("v7"));
}

#[test]
fn test_callbacks_can_chain_requests() {
    let event_loop = setup_loop(2);
    let db = Rc::new(open_database(&event_loop));
    let (sink, result) = slot();

    let chained = Rc::clone(&db);
    db.set("k", "first", move |stored| {
        stored.unwrap();
        chained
            .get("k", move |value| *sink.borrow_mut() = Some(value.unwrap()))
            .unwrap();
    })
    .unwrap();

    // run() keeps going until the chained get is delivered too
    assert_eq!(event_loop.run(), 2);
    assert_eq!(
        result.borrow_mut().take().unwrap(),
        Some(Bytes::from("first"))
    );
}

#[test]
fn test_poll_does_not_block() {
    let event_loop = setup_loop(1);
    let db = open_database(&event_loop);
    let done = Rc::new(Cell::new(false));

    let flag = Rc::clone(&done);
    db.count(move |n| {
        assert_eq!(n.unwrap(), 0);
        flag.set(true);
    })
    .unwrap();

    let mut delivered = 0;
    for _ in 0..500 {
        delivered += event_loop.poll();
        if done.get() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(done.get());
    assert_eq!(delivered, 1);
    assert_eq!(event_loop.poll(), 0);
}

#[test]
fn test_engine_errors_are_delivered() {
    let event_loop = setup_loop(1);
    let db = open_database(&event_loop);
    let (sink, result) = slot();

    db.add("k", "1", |added| added.unwrap()).unwrap();
    event_loop.run();
    db.add("k", "2", move |added| *sink.borrow_mut() = Some(added))
        .unwrap();
    event_loop.run();

    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
}

// =============================================================================
// Rejection Tests
// =============================================================================

#[test]
fn test_invalid_request_rejected_synchronously() {
    let event_loop = setup_loop(1);
    let db = open_database(&event_loop);

    let err = db
        .increment_float("f", f64::INFINITY, 0.0, |_| {
            panic!("rejected request must not be delivered")
        })
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidRequest(_)));
    assert_eq!(event_loop.in_flight(), 0);

    let err = db
        .match_regex("(unclosed", -1, |_| panic!("not delivered"))
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidRequest(_)));
    assert_eq!(event_loop.run(), 0);
}

#[test]
fn test_bad_mode_string_rejected() {
    let event_loop = setup_loop(1);
    let db = Database::new(&event_loop);

    let err = db.open("+", "rw", |_| panic!("not delivered")).unwrap_err();
    assert!(matches!(err, AtlasError::InvalidRequest(_)));
    assert_eq!(db.state(), DbState::Closed);
}

#[test]
fn test_closed_database_rejects_operations() {
    let event_loop = setup_loop(1);
    let db = Database::new(&event_loop);

    let err = db.get("k", |_| panic!("not delivered")).unwrap_err();
    assert!(matches!(err, AtlasError::Closed("get")));
    assert!(matches!(db.cursor(), Err(AtlasError::Closed(_))));
    assert!(matches!(db.close(|_| {}), Err(AtlasError::Closed("close"))));
}

#[test]
fn test_open_twice_rejected() {
    let event_loop = setup_loop(1);
    let db = open_database(&event_loop);

    assert!(matches!(
        db.open("+", "a+", |_| {}),
        Err(AtlasError::InvalidRequest(_))
    ));
}

#[test]
fn test_close_then_reopen() {
    let event_loop = setup_loop(1);
    let db = open_database(&event_loop);

    db.close(|closed| closed.unwrap()).unwrap();
    assert_eq!(db.state(), DbState::Closing);
    event_loop.run();
    assert_eq!(db.state(), DbState::Closed);

    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();
    assert!(db.is_open());
}

#[test]
fn test_failed_open_returns_to_closed() {
    let event_loop = setup_loop(1);
    let db = Database::new(&event_loop);
    let temp_dir = tempfile::TempDir::new().unwrap();
    let path = temp_dir.path().join("missing.snap");

    let (sink, result) = slot();
    db.open(path.to_str().unwrap(), "r", move |opened| {
        *sink.borrow_mut() = Some(opened)
    })
    .unwrap();
    assert_eq!(db.state(), DbState::Opening);
    event_loop.run();

    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RepositoryMissing);
    assert_eq!(db.state(), DbState::Closed);
}

// =============================================================================
// Resource Release & Fault Tests
// =============================================================================

#[test]
fn test_store_reference_released_after_delivery() {
    let event_loop = setup_loop(2);
    let store = Arc::new(MemoryStore::new());
    let db = Database::with_store(&event_loop, store.clone());
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();

    let baseline = Arc::strong_count(&store);
    for i in 0..10 {
        db.set(format!("k{}", i), "v", |stored| stored.unwrap()).unwrap();
    }
    assert_eq!(Arc::strong_count(&store), baseline + 10);

    event_loop.run();
    assert_eq!(Arc::strong_count(&store), baseline);
}

#[test]
fn test_engine_panic_becomes_system_error() {
    let event_loop = setup_loop(1);
    let store = Arc::new(PanickyStore {
        inner: MemoryStore::new(),
    });
    let db = Database::with_store(&event_loop, store);
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();

    let (sink, result) = slot();
    db.get("k", move |value| *sink.borrow_mut() = Some(value))
        .unwrap();
    assert_eq!(event_loop.run(), 1);

    let err = result.borrow_mut().take().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SystemError);

    // The pool survives the panic
    db.set("k", "v", |stored| stored.unwrap()).unwrap();
    assert_eq!(event_loop.run(), 1);
}

#[test]
fn test_callback_panic_propagates_and_releases_store() {
    let event_loop = setup_loop(1);
    let store = Arc::new(MemoryStore::new());
    let db = Database::with_store(&event_loop, store.clone());
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();

    let baseline = Arc::strong_count(&store);
    db.set("k", "v", |_| panic!("caller bug")).unwrap();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| event_loop.run()));
    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"caller bug"));

    assert_eq!(event_loop.in_flight(), 0);
    assert_eq!(Arc::strong_count(&store), baseline);
}
