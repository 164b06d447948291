//! Cursor Tests
//!
//! Tests verify:
//! - Ascending and descending traversal through the event loop
//! - "No record" reported as false / None
//! - Key blocks, including the partial block at the end
//! - Writes through a cursor
//! - Cursors invalidated when their database closes
//! - `each` iteration and early exit

use std::cell::RefCell;
use std::ops::ControlFlow;
use std::rc::Rc;

use atlascab::{AtlasError, Config, Cursor, Database, EventLoop, RequestId, Result};
use bytes::Bytes;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup(keys: &[&str]) -> (EventLoop, Database) {
    let event_loop = EventLoop::new(Config::builder().worker_threads(2).build()).unwrap();
    let db = Database::new(&event_loop);
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();

    for key in keys {
        db.set(key, format!("v-{}", key), |stored| stored.unwrap())
            .unwrap();
    }
    event_loop.run();
    (event_loop, db)
}

/// Submit one request and run the loop until it is delivered
fn wait<T, S>(event_loop: &EventLoop, submit: S) -> Result<T>
where
    T: 'static,
    S: FnOnce(Box<dyn FnOnce(Result<T>)>) -> Result<RequestId>,
{
    let slot = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&slot);
    submit(Box::new(move |result| *sink.borrow_mut() = Some(result)))?;
    event_loop.run();
    let delivered = slot.borrow_mut().take();
    delivered.unwrap()
}

fn key_at(event_loop: &EventLoop, cursor: &Cursor) -> Option<Bytes> {
    wait(event_loop, |done| cursor.get_key(false, done)).unwrap()
}

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

// =============================================================================
// Traversal Tests
// =============================================================================

#[test]
fn test_ascending_traversal() {
    let (event_loop, db) = setup(&["c", "a", "b"]);
    let cursor = db.cursor().unwrap();

    assert!(wait(&event_loop, |done| cursor.jump(done)).unwrap());
    let mut seen = Vec::new();
    while let Some((key, value)) = wait(&event_loop, |done| cursor.get(true, done)).unwrap() {
        assert_eq!(value, Bytes::from(format!("v-{}", String::from_utf8_lossy(&key))));
        seen.push(key);
    }

    assert_eq!(seen, vec![b("a"), b("b"), b("c")]);
    assert_eq!(key_at(&event_loop, &cursor), None);
}

#[test]
fn test_descending_traversal() {
    let (event_loop, db) = setup(&["a", "b", "c"]);
    let cursor = db.cursor().unwrap();

    assert!(wait(&event_loop, |done| cursor.jump_back(done)).unwrap());
    let mut seen = vec![key_at(&event_loop, &cursor).unwrap()];
    while wait(&event_loop, |done| cursor.step_back(done)).unwrap() {
        seen.push(key_at(&event_loop, &cursor).unwrap());
    }

    assert_eq!(seen, vec![b("c"), b("b"), b("a")]);
}

#[test]
fn test_step_forward_visits_each_record_once() {
    let (event_loop, db) = setup(&["a", "b", "c"]);
    let cursor = db.cursor().unwrap();

    assert!(wait(&event_loop, |done| cursor.jump(done)).unwrap());
    let mut seen = vec![key_at(&event_loop, &cursor).unwrap()];
    while wait(&event_loop, |done| cursor.step(done)).unwrap() {
        seen.push(key_at(&event_loop, &cursor).unwrap());
    }

    assert_eq!(seen, vec![b("a"), b("b"), b("c")]);
    assert_eq!(wait(&event_loop, |done| cursor.get(false, done)).unwrap(), None);
}

#[test]
fn test_step_back_visits_each_record_once() {
    let (event_loop, db) = setup(&["a", "b", "c"]);
    let cursor = db.cursor().unwrap();

    assert!(wait(&event_loop, |done| cursor.jump_back(done)).unwrap());
    let mut seen = vec![key_at(&event_loop, &cursor).unwrap()];
    while wait(&event_loop, |done| cursor.step_back(done)).unwrap() {
        seen.push(key_at(&event_loop, &cursor).unwrap());
    }

    assert_eq!(seen, vec![b("c"), b("b"), b("a")]);
    assert_eq!(wait(&event_loop, |done| cursor.get(false, done)).unwrap(), None);
}

#[test]
fn test_jump_to_nearest_key() {
    let (event_loop, db) = setup(&["apple", "banana", "cherry"]);
    let cursor = db.cursor().unwrap();

    assert!(wait(&event_loop, |done| cursor.jump_to("b", done)).unwrap());
    assert_eq!(key_at(&event_loop, &cursor), Some(b("banana")));

    assert!(wait(&event_loop, |done| cursor.jump_back_to("c", done)).unwrap());
    assert_eq!(key_at(&event_loop, &cursor), Some(b("banana")));

    assert!(!wait(&event_loop, |done| cursor.jump_to("zzz", done)).unwrap());
    assert!(!wait(&event_loop, |done| cursor.jump_back_to("a", done)).unwrap());
}

#[test]
fn test_empty_database_has_no_records() {
    let (event_loop, db) = setup(&[]);
    let cursor = db.cursor().unwrap();

    assert!(!wait(&event_loop, |done| cursor.jump(done)).unwrap());
    assert!(!wait(&event_loop, |done| cursor.step(done)).unwrap());
    assert_eq!(
        wait(&event_loop, |done| cursor.get_value(false, done)).unwrap(),
        None
    );
}

// =============================================================================
// Key Block Tests
// =============================================================================

#[test]
fn test_key_blocks_with_partial_tail() {
    let keys: Vec<String> = (0..7).map(|i| format!("k{}", i)).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let (event_loop, db) = setup(&refs);
    let cursor = db.cursor().unwrap();
    wait(&event_loop, |done| cursor.jump(done)).unwrap();

    let first = wait(&event_loop, |done| cursor.get_key_block(3, done)).unwrap();
    let second = wait(&event_loop, |done| cursor.get_key_block(3, done)).unwrap();
    let tail = wait(&event_loop, |done| cursor.get_key_block(3, done)).unwrap();
    let after = wait(&event_loop, |done| cursor.get_key_block(3, done)).unwrap();

    assert_eq!(first, vec![b("k0"), b("k1"), b("k2")]);
    assert_eq!(second, vec![b("k3"), b("k4"), b("k5")]);
    assert_eq!(tail, vec![b("k6")]);
    assert!(after.is_empty());
}

#[test]
fn test_oversized_key_block_rejected() {
    let (event_loop, db) = setup(&["a"]);
    let cursor = db.cursor().unwrap();
    let limit = event_loop.config().max_key_block;

    let err = cursor
        .get_key_block(limit + 1, |_| panic!("not delivered"))
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidRequest(_)));
}

// =============================================================================
// Cursor Write Tests
// =============================================================================

#[test]
fn test_set_value_and_remove() {
    let (event_loop, db) = setup(&["a", "b", "c"]);
    let cursor = db.cursor().unwrap();
    wait(&event_loop, |done| cursor.jump(done)).unwrap();

    wait(&event_loop, |done| cursor.set_value("A", true, done)).unwrap();
    assert_eq!(key_at(&event_loop, &cursor), Some(b("b")));

    wait(&event_loop, |done| cursor.remove(done)).unwrap();
    assert_eq!(key_at(&event_loop, &cursor), Some(b("c")));

    let records = wait(&event_loop, |done| db.get_bulk(&["a", "b", "c"], true, done)).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[&b("a")], b("A"));
}

#[test]
fn test_cursor_rejected_after_close() {
    let (event_loop, db) = setup(&["a"]);
    let cursor = db.cursor().unwrap();

    wait(&event_loop, |done| db.close(done)).unwrap();
    let err = cursor.jump(|_| panic!("not delivered")).unwrap_err();
    assert!(matches!(err, AtlasError::Closed("cursor.jump")));
}

#[test]
fn test_cursor_invalidated_by_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("cursor.snap");
    let path = path.to_str().unwrap().to_string();
    let event_loop = EventLoop::new(Config::builder().worker_threads(2).build()).unwrap();
    let db = Database::new(&event_loop);

    wait(&event_loop, |done| db.open(&path, "a+", done)).unwrap();
    wait(&event_loop, |done| db.set("a", "a", done)).unwrap();
    wait(&event_loop, |done| db.set("b", "b", done)).unwrap();
    let stale = db.cursor().unwrap();
    assert!(wait(&event_loop, |done| stale.jump_to("b", done)).unwrap());
    assert!(stale.is_valid());

    wait(&event_loop, |done| db.close(done)).unwrap();
    wait(&event_loop, |done| db.open(&path, "a+", done)).unwrap();

    assert!(!stale.is_valid());
    let err = stale.get(false, |_| panic!("not delivered")).unwrap_err();
    assert!(matches!(err, AtlasError::Closed("cursor.get")));
    assert_eq!(event_loop.in_flight(), 0);

    // A cursor made after the reopen starts fresh
    let fresh = db.cursor().unwrap();
    assert!(wait(&event_loop, |done| fresh.jump(done)).unwrap());
    assert_eq!(key_at(&event_loop, &fresh), Some(b("a")));
}

// =============================================================================
// Each Tests
// =============================================================================

#[test]
fn test_each_visits_in_order() {
    let (event_loop, db) = setup(&["b", "c", "a"]);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let sink = Rc::clone(&seen);
    wait(&event_loop, |done| {
        db.each(
            move |key, _| {
                sink.borrow_mut().push(Bytes::copy_from_slice(key));
                ControlFlow::Continue(())
            },
            done,
        )
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![b("a"), b("b"), b("c")]);
}

#[test]
fn test_each_stops_on_break() {
    let (event_loop, db) = setup(&["a", "b", "c", "d"]);
    let visits = Rc::new(RefCell::new(0));

    let counter = Rc::clone(&visits);
    wait(&event_loop, |done| {
        db.each(
            move |_, _| {
                *counter.borrow_mut() += 1;
                if *counter.borrow() == 2 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
            done,
        )
    })
    .unwrap();

    assert_eq!(*visits.borrow(), 2);
}

#[test]
fn test_each_on_empty_database() {
    let (event_loop, db) = setup(&[]);
    wait(&event_loop, |done| {
        db.each(|_, _| panic!("no records to visit"), done)
    })
    .unwrap();
}
