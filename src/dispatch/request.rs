//! Operation descriptors and replies
//!
//! A [`Descriptor`] owns everything a request needs on the worker: its
//! inputs and a strong reference to the store (and cursor). It travels to
//! a worker, is executed once, and travels back with the outcome so it is
//! released on the loop thread after delivery.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use regex::bytes::Regex;

use crate::config::Config;
use crate::engine::{Store, StoreCursor};
use crate::error::{AtlasError, ErrorKind, Result};
use crate::indexed::IndexedWrite;
use crate::types::OpenMode;

/// A store cursor shared between its facade and in-flight requests
pub type SharedCursor = Arc<Mutex<Box<dyn StoreCursor>>>;

// =============================================================================
// Database Operations
// =============================================================================

#[derive(Debug, Clone)]
pub enum DbOp {
    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------
    Open { path: String, mode: OpenMode },
    Close,
    Clear,

    // -------------------------------------------------------------------------
    // Point Operations
    // -------------------------------------------------------------------------
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
    Add { key: Bytes, value: Bytes },
    Replace { key: Bytes, value: Bytes },
    Append { key: Bytes, value: Bytes },
    Remove { key: Bytes },
    Increment { key: Bytes, delta: i64, initial: i64 },
    IncrementFloat { key: Bytes, delta: f64, initial: f64 },
    CompareAndSwap {
        key: Bytes,
        old: Option<Bytes>,
        new: Option<Bytes>,
    },

    // -------------------------------------------------------------------------
    // Bulk & Matching
    // -------------------------------------------------------------------------
    GetBulk { keys: Vec<Bytes>, atomic: bool },
    SetBulk { items: BTreeMap<Bytes, Bytes>, atomic: bool },
    RemoveBulk { keys: Vec<Bytes>, atomic: bool },
    MatchPrefix { prefix: Bytes, max: Option<usize> },
    MatchRegex { pattern: Regex, max: Option<usize> },

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------
    Synchronize { hard: bool },
    Copy { dest: PathBuf },
    DumpSnapshot { dest: PathBuf },
    LoadSnapshot { src: PathBuf },
    Count,
    Size,
    Status,

    // -------------------------------------------------------------------------
    // Indexed Writes
    // -------------------------------------------------------------------------
    Indexed(IndexedWrite),
}

fn require_path(op: &str, path: &std::path::Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(AtlasError::InvalidRequest(format!("{}: path is empty", op)));
    }
    Ok(())
}

impl DbOp {
    pub fn name(&self) -> &'static str {
        match self {
            DbOp::Open { .. } => "open",
            DbOp::Close => "close",
            DbOp::Clear => "clear",
            DbOp::Get { .. } => "get",
            DbOp::Set { .. } => "set",
            DbOp::Add { .. } => "add",
            DbOp::Replace { .. } => "replace",
            DbOp::Append { .. } => "append",
            DbOp::Remove { .. } => "remove",
            DbOp::Increment { .. } => "increment",
            DbOp::IncrementFloat { .. } => "increment_float",
            DbOp::CompareAndSwap { .. } => "cas",
            DbOp::GetBulk { .. } => "get_bulk",
            DbOp::SetBulk { .. } => "set_bulk",
            DbOp::RemoveBulk { .. } => "remove_bulk",
            DbOp::MatchPrefix { .. } => "match_prefix",
            DbOp::MatchRegex { .. } => "match_regex",
            DbOp::Synchronize { .. } => "synchronize",
            DbOp::Copy { .. } => "copy",
            DbOp::DumpSnapshot { .. } => "dump_snapshot",
            DbOp::LoadSnapshot { .. } => "load_snapshot",
            DbOp::Count => "count",
            DbOp::Size => "size",
            DbOp::Status => "status",
            DbOp::Indexed(write) => write.primary.name(),
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            DbOp::Open { path, mode } => {
                if path.is_empty() {
                    return Err(AtlasError::InvalidRequest("open: path is empty".to_string()));
                }
                if !mode.contains(OpenMode::READER) && !mode.contains(OpenMode::WRITER) {
                    return Err(AtlasError::InvalidRequest(
                        "open: mode must include READER or WRITER".to_string(),
                    ));
                }
                Ok(())
            }
            DbOp::IncrementFloat { delta, initial, .. } => {
                if !delta.is_finite() || !initial.is_finite() {
                    return Err(AtlasError::InvalidRequest(
                        "increment_float: operands must be finite".to_string(),
                    ));
                }
                Ok(())
            }
            DbOp::Copy { dest } | DbOp::DumpSnapshot { dest } => require_path(self.name(), dest),
            DbOp::LoadSnapshot { src } => require_path(self.name(), src),
            DbOp::Indexed(write) => write.validate(),
            _ => Ok(()),
        }
    }

    fn execute(&self, store: &dyn Store) -> Result<Reply> {
        let reply = match self {
            DbOp::Open { path, mode } => store.open(path, *mode).map(|()| Reply::Unit)?,
            DbOp::Close => store.close().map(|()| Reply::Unit)?,
            DbOp::Clear => store.clear().map(|()| Reply::Unit)?,

            DbOp::Get { key } => match store.get(key) {
                Ok(value) => Reply::Value(Some(value)),
                Err(e) if e.is_not_found() => Reply::Value(None),
                Err(e) => return Err(e.into()),
            },
            DbOp::Set { key, value } => store.set(key, value).map(|()| Reply::Unit)?,
            DbOp::Add { key, value } => store.add(key, value).map(|()| Reply::Unit)?,
            DbOp::Replace { key, value } => store.replace(key, value).map(|()| Reply::Unit)?,
            DbOp::Append { key, value } => store.append(key, value).map(|()| Reply::Unit)?,
            DbOp::Remove { key } => store.remove(key).map(|()| Reply::Unit)?,
            DbOp::Increment {
                key,
                delta,
                initial,
            } => Reply::Integer(store.increment(key, *delta, *initial)?),
            DbOp::IncrementFloat {
                key,
                delta,
                initial,
            } => Reply::Float(store.increment_float(key, *delta, *initial)?),
            DbOp::CompareAndSwap { key, old, new } => {
                match store.compare_and_swap(key, old.as_deref(), new.as_deref()) {
                    Ok(swapped) => Reply::Flag(swapped),
                    // A lost race is an expected outcome, not a failure
                    Err(e) if e.kind == ErrorKind::LogicConflict => Reply::Flag(false),
                    Err(e) => return Err(e.into()),
                }
            }

            DbOp::GetBulk { keys, atomic } => Reply::Records(store.get_bulk(keys, *atomic)?),
            DbOp::SetBulk { items, atomic } => Reply::Count(store.set_bulk(items, *atomic)?),
            DbOp::RemoveBulk { keys, atomic } => Reply::Count(store.remove_bulk(keys, *atomic)?),
            DbOp::MatchPrefix { prefix, max } => Reply::Keys(store.match_prefix(prefix, *max)?),
            DbOp::MatchRegex { pattern, max } => Reply::Keys(store.match_regex(pattern, *max)?),

            DbOp::Synchronize { hard } => store.synchronize(*hard).map(|()| Reply::Unit)?,
            DbOp::Copy { dest } => store.copy(dest).map(|()| Reply::Unit)?,
            DbOp::DumpSnapshot { dest } => store.dump_snapshot(dest).map(|()| Reply::Unit)?,
            DbOp::LoadSnapshot { src } => store.load_snapshot(src).map(|()| Reply::Unit)?,
            DbOp::Count => Reply::Size(store.count()?),
            DbOp::Size => Reply::Size(store.size()?),
            DbOp::Status => Reply::Status(store.status()?),

            DbOp::Indexed(write) => write.apply(store).map(|()| Reply::Unit)?,
        };
        Ok(reply)
    }
}

// =============================================================================
// Cursor Operations
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorOp {
    Jump,
    JumpTo { key: Bytes },
    JumpBack,
    JumpBackTo { key: Bytes },
    Step,
    StepBack,
    Get { step: bool },
    GetKey { step: bool },
    GetValue { step: bool },
    GetKeyBlock { count: usize },
    SetValue { value: Bytes, step: bool },
    Remove,
}

/// Movement reports `false` instead of "no record"
fn moved(result: crate::error::EngineResult<()>) -> Result<Reply> {
    match result {
        Ok(()) => Ok(Reply::Flag(true)),
        Err(e) if e.is_not_found() => Ok(Reply::Flag(false)),
        Err(e) => Err(e.into()),
    }
}

/// Reads report `None` instead of "no record"
fn found<T>(result: crate::error::EngineResult<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl CursorOp {
    pub fn name(&self) -> &'static str {
        match self {
            CursorOp::Jump => "cursor.jump",
            CursorOp::JumpTo { .. } => "cursor.jump_to",
            CursorOp::JumpBack => "cursor.jump_back",
            CursorOp::JumpBackTo { .. } => "cursor.jump_back_to",
            CursorOp::Step => "cursor.step",
            CursorOp::StepBack => "cursor.step_back",
            CursorOp::Get { .. } => "cursor.get",
            CursorOp::GetKey { .. } => "cursor.get_key",
            CursorOp::GetValue { .. } => "cursor.get_value",
            CursorOp::GetKeyBlock { .. } => "cursor.get_key_block",
            CursorOp::SetValue { .. } => "cursor.set_value",
            CursorOp::Remove => "cursor.remove",
        }
    }

    fn validate(&self, config: &Config) -> Result<()> {
        match self {
            CursorOp::GetKeyBlock { count } if *count > config.max_key_block => {
                Err(AtlasError::InvalidRequest(format!(
                    "cursor.get_key_block: {} exceeds the limit of {}",
                    count, config.max_key_block
                )))
            }
            _ => Ok(()),
        }
    }

    fn execute(&self, cursor: &mut dyn StoreCursor) -> Result<Reply> {
        match self {
            CursorOp::Jump => moved(cursor.jump()),
            CursorOp::JumpTo { key } => moved(cursor.jump_to(key)),
            CursorOp::JumpBack => moved(cursor.jump_back()),
            CursorOp::JumpBackTo { key } => moved(cursor.jump_back_to(key)),
            CursorOp::Step => moved(cursor.step()),
            CursorOp::StepBack => moved(cursor.step_back()),
            CursorOp::Get { step } => found(cursor.get(*step)).map(Reply::Record),
            CursorOp::GetKey { step } => found(cursor.get_key(*step)).map(Reply::Value),
            CursorOp::GetValue { step } => found(cursor.get_value(*step)).map(Reply::Value),
            CursorOp::GetKeyBlock { count } => {
                let mut keys = Vec::with_capacity(*count);
                while keys.len() < *count {
                    match found(cursor.get_key(true))? {
                        Some(key) => keys.push(key),
                        None => break,
                    }
                }
                Ok(Reply::Keys(keys))
            }
            CursorOp::SetValue { value, step } => {
                cursor.set_value(value, *step)?;
                Ok(Reply::Unit)
            }
            CursorOp::Remove => {
                cursor.remove()?;
                Ok(Reply::Unit)
            }
        }
    }
}

// =============================================================================
// Descriptor
// =============================================================================

/// One self-contained request
pub enum Descriptor {
    Db {
        op: DbOp,
        store: Arc<dyn Store>,
    },
    Cursor {
        op: CursorOp,
        store: Arc<dyn Store>,
        cursor: SharedCursor,
    },
}

impl Descriptor {
    pub fn name(&self) -> &'static str {
        match self {
            Descriptor::Db { op, .. } => op.name(),
            Descriptor::Cursor { op, .. } => op.name(),
        }
    }

    /// Shape checks run before scheduling
    pub fn validate(&self, config: &Config) -> Result<()> {
        match self {
            Descriptor::Db { op, .. } => op.validate(),
            Descriptor::Cursor { op, .. } => op.validate(config),
        }
    }

    /// The blocking call sequence, run once on a worker
    pub fn execute(&self) -> Result<Reply> {
        match self {
            Descriptor::Db { op, store } => op.execute(&**store),
            Descriptor::Cursor { op, cursor, .. } => {
                let mut cursor = cursor.lock();
                op.execute(&mut **cursor)
            }
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("op", &self.name())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Reply
// =============================================================================

/// Untyped success payload of a request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Unit,
    Value(Option<Bytes>),
    Record(Option<(Bytes, Bytes)>),
    Integer(i64),
    Float(f64),
    Flag(bool),
    Count(usize),
    Size(u64),
    Records(BTreeMap<Bytes, Bytes>),
    Keys(Vec<Bytes>),
    Status(BTreeMap<String, String>),
}

impl Reply {
    pub fn into_unit(self) -> Result<()> {
        match self {
            Reply::Unit => Ok(()),
            _ => Err(AtlasError::UnexpectedReply("unit")),
        }
    }

    pub fn into_value(self) -> Result<Option<Bytes>> {
        match self {
            Reply::Value(value) => Ok(value),
            _ => Err(AtlasError::UnexpectedReply("value")),
        }
    }

    pub fn into_record(self) -> Result<Option<(Bytes, Bytes)>> {
        match self {
            Reply::Record(record) => Ok(record),
            _ => Err(AtlasError::UnexpectedReply("record")),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self {
            Reply::Integer(n) => Ok(n),
            _ => Err(AtlasError::UnexpectedReply("integer")),
        }
    }

    pub fn into_float(self) -> Result<f64> {
        match self {
            Reply::Float(n) => Ok(n),
            _ => Err(AtlasError::UnexpectedReply("float")),
        }
    }

    pub fn into_flag(self) -> Result<bool> {
        match self {
            Reply::Flag(flag) => Ok(flag),
            _ => Err(AtlasError::UnexpectedReply("flag")),
        }
    }

    pub fn into_count(self) -> Result<usize> {
        match self {
            Reply::Count(n) => Ok(n),
            _ => Err(AtlasError::UnexpectedReply("count")),
        }
    }

    pub fn into_size(self) -> Result<u64> {
        match self {
            Reply::Size(n) => Ok(n),
            _ => Err(AtlasError::UnexpectedReply("size")),
        }
    }

    pub fn into_records(self) -> Result<BTreeMap<Bytes, Bytes>> {
        match self {
            Reply::Records(records) => Ok(records),
            _ => Err(AtlasError::UnexpectedReply("records")),
        }
    }

    pub fn into_keys(self) -> Result<Vec<Bytes>> {
        match self {
            Reply::Keys(keys) => Ok(keys),
            _ => Err(AtlasError::UnexpectedReply("keys")),
        }
    }

    pub fn into_status(self) -> Result<BTreeMap<String, String>> {
        match self {
            Reply::Status(status) => Ok(status),
            _ => Err(AtlasError::UnexpectedReply("status")),
        }
    }
}
