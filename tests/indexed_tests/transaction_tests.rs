//! Indexed Write Tests
//!
//! Tests verify:
//! - Primary and index entries commit together
//! - Conflicts report every offending entry and roll everything back
//! - Removals only touch entries owned by the primary key
//! - Primary failures short-circuit index work

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use atlascab::{
    AtlasError, Config, Database, ErrorKind, EventLoop, IndexKey, IndexedWrite, MemoryStore,
    PrimaryWrite, Result, Store,
};
use bytes::Bytes;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store() -> MemoryStore {
    MemoryStore::open_in_memory().unwrap()
}

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn email(address: &str) -> IndexKey {
    IndexKey::new("email", address)
}

fn add(key: &str, value: &str) -> PrimaryWrite {
    PrimaryWrite::Add {
        key: b(key),
        value: b(value),
    }
}

fn replace(key: &str, value: &str) -> PrimaryWrite {
    PrimaryWrite::Replace {
        key: b(key),
        value: b(value),
    }
}

/// Store with user u1 owning a@x and b@x
fn store_with_u1() -> MemoryStore {
    let store = setup_store();
    IndexedWrite::new(add("u1", "alice"))
        .upsert(email("a@x"), "u1")
        .upsert(email("b@x"), "u1")
        .apply(&store)
        .unwrap();
    store
}

// =============================================================================
// Apply Tests
// =============================================================================

#[test]
fn test_add_with_indexes_commits_everything() {
    let store = store_with_u1();

    assert_eq!(store.get(b"u1").unwrap(), b("alice"));
    assert_eq!(store.get(email("a@x").as_bytes()).unwrap(), b("u1"));
    assert_eq!(store.get(email("b@x").as_bytes()).unwrap(), b("u1"));
    assert_eq!(
        store.match_prefix(&IndexKey::namespace_prefix("email"), None).unwrap(),
        vec![email("a@x").to_bytes(), email("b@x").to_bytes()]
    );
}

#[test]
fn test_conflict_reports_every_entry_and_rolls_back() {
    let store = store_with_u1();

    let err = IndexedWrite::new(add("u2", "bob"))
        .upsert(email("a@x"), "u2")
        .upsert(email("b@x"), "u2")
        .upsert(email("c@x"), "u2")
        .apply(&store)
        .unwrap_err();

    let errors = err.index_errors().unwrap();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[&email("a@x")], b("u1"));
    assert_eq!(errors[&email("b@x")], b("u1"));
    assert_eq!(err.kind(), ErrorKind::LogicConflict);

    // Neither the primary record nor the free index key was kept
    assert!(store.get(b"u2").unwrap_err().is_not_found());
    assert!(store.get(email("c@x").as_bytes()).unwrap_err().is_not_found());
    assert_eq!(store.count().unwrap(), 3);
}

#[test]
fn test_replace_moves_index_entries() {
    let store = store_with_u1();

    IndexedWrite::new(replace("u1", "alice2"))
        .upsert(email("new@x"), "u1")
        .remove_index(email("a@x"))
        .apply(&store)
        .unwrap();

    assert_eq!(store.get(b"u1").unwrap(), b("alice2"));
    assert_eq!(store.get(email("new@x").as_bytes()).unwrap(), b("u1"));
    assert!(store.get(email("a@x").as_bytes()).unwrap_err().is_not_found());
    assert_eq!(store.get(email("b@x").as_bytes()).unwrap(), b("u1"));
}

#[test]
fn test_removal_of_foreign_entry_conflicts() {
    let store = store_with_u1();
    store.set(b"u2", b"bob").unwrap();

    let err = IndexedWrite::new(replace("u2", "bob2"))
        .remove_index(email("a@x"))
        .apply(&store)
        .unwrap_err();

    assert_eq!(err.index_errors().unwrap()[&email("a@x")], b("u1"));
    assert_eq!(store.get(b"u2").unwrap(), b("bob"));
    assert_eq!(store.get(email("a@x").as_bytes()).unwrap(), b("u1"));
}

#[test]
fn test_removal_of_missing_entry_is_fine() {
    let store = store_with_u1();

    IndexedWrite::new(PrimaryWrite::Remove { key: b("u1") })
        .remove_index(email("a@x"))
        .remove_index(email("b@x"))
        .remove_index(email("never@x"))
        .apply(&store)
        .unwrap();

    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn test_primary_failure_skips_index_work() {
    let store = store_with_u1();

    let err = IndexedWrite::new(add("u1", "dup"))
        .upsert(email("z@x"), "u1")
        .apply(&store)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::DuplicateRecord);
    assert!(err.index_errors().is_none());
    assert!(store.get(email("z@x").as_bytes()).unwrap_err().is_not_found());
    assert_eq!(store.get(b"u1").unwrap(), b("alice"));
}

#[test]
fn test_replace_missing_record_fails() {
    let store = setup_store();

    let err = IndexedWrite::new(replace("ghost", "v"))
        .upsert(email("g@x"), "ghost")
        .apply(&store)
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RecordNotFound);
    assert_eq!(store.count().unwrap(), 0);
}

#[test]
fn test_store_usable_after_conflict() {
    let store = store_with_u1();

    let _ = IndexedWrite::new(add("u2", "bob"))
        .upsert(email("a@x"), "u2")
        .apply(&store);

    // No transaction left behind
    assert_eq!(store.status().unwrap()["in_transaction"], "false");
    IndexedWrite::new(add("u2", "bob"))
        .upsert(email("bob@x"), "u2")
        .apply(&store)
        .unwrap();
    assert_eq!(store.get(email("bob@x").as_bytes()).unwrap(), b("u2"));
}

#[test]
fn test_remove_with_upserts_rejected() {
    let write = IndexedWrite::new(PrimaryWrite::Remove { key: b("u1") }).upsert(email("a@x"), "u1");
    assert!(matches!(write.validate(), Err(AtlasError::InvalidRequest(_))));
}

// =============================================================================
// Through the Database
// =============================================================================

#[test]
fn test_indexed_writes_through_database() {
    let event_loop = EventLoop::new(Config::builder().worker_threads(2).build()).unwrap();
    let db = Database::new(&event_loop);
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();

    let mut upserts = BTreeMap::new();
    upserts.insert(email("a@x"), b("u1"));
    db.add_indexed("u1", "alice", upserts, |added| added.unwrap())
        .unwrap();
    event_loop.run();

    let outcome: Rc<RefCell<Option<Result<()>>>> = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&outcome);
    let mut stolen = BTreeMap::new();
    stolen.insert(email("a@x"), b("u2"));
    db.add_indexed("u2", "bob", stolen, move |added| {
        *sink.borrow_mut() = Some(added)
    })
    .unwrap();
    event_loop.run();

    let err = outcome.borrow_mut().take().unwrap().unwrap_err();
    assert!(matches!(err, AtlasError::IndexConflict { .. }));

    let mut removals = BTreeSet::new();
    removals.insert(email("a@x"));
    db.remove_indexed("u1", removals, |removed| removed.unwrap())
        .unwrap();
    event_loop.run();

    let sink = Rc::clone(&outcome);
    db.count(move |n| {
        assert_eq!(n.unwrap(), 0);
        *sink.borrow_mut() = Some(Ok(()));
    })
    .unwrap();
    event_loop.run();
    assert!(outcome.borrow_mut().take().unwrap().is_ok());
}

#[test]
fn test_invalid_indexed_write_rejected_synchronously() {
    let event_loop = EventLoop::new(Config::default()).unwrap();
    let db = Database::new(&event_loop);
    db.open("+", "a+", |opened| opened.unwrap()).unwrap();
    event_loop.run();

    let mut upserts = BTreeMap::new();
    upserts.insert(IndexKey::raw("u1"), b("u1"));
    let err = db
        .add_indexed("u1", "v", upserts, |_| panic!("not delivered"))
        .unwrap_err();
    assert!(matches!(err, AtlasError::InvalidRequest(_)));
}
