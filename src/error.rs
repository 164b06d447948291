//! Error types for AtlasCab
//!
//! Two layers:
//! - [`EngineError`]: what the storage engine reports, classified by [`ErrorKind`]
//! - [`AtlasError`]: the crate-wide error delivered to callers

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::types::IndexKey;

/// Result type alias using AtlasError
pub type Result<T> = std::result::Result<T, AtlasError>;

/// Result type returned by [`Store`](crate::engine::Store) implementations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Conflicting index entries: index key → value actually stored there
pub type IndexErrors = BTreeMap<IndexKey, Bytes>;

// =============================================================================
// Engine Classification
// =============================================================================

/// Failure classes reported by the storage engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoImplementation,
    InvalidInput,
    RepositoryMissing,
    PermissionDenied,
    DataCorruption,
    DuplicateRecord,
    RecordNotFound,
    LogicConflict,
    SystemError,
    Miscellaneous,
}

impl ErrorKind {
    /// Numeric code of this kind (0 is reserved for success)
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::NoImplementation => 1,
            ErrorKind::InvalidInput => 2,
            ErrorKind::RepositoryMissing => 3,
            ErrorKind::PermissionDenied => 4,
            ErrorKind::DataCorruption => 5,
            ErrorKind::DuplicateRecord => 6,
            ErrorKind::RecordNotFound => 7,
            ErrorKind::LogicConflict => 8,
            ErrorKind::SystemError => 9,
            ErrorKind::Miscellaneous => 15,
        }
    }

    /// Short engine-style name of this kind
    pub fn codename(self) -> &'static str {
        match self {
            ErrorKind::NoImplementation => "not implemented",
            ErrorKind::InvalidInput => "invalid operation",
            ErrorKind::RepositoryMissing => "file not found",
            ErrorKind::PermissionDenied => "no permission",
            ErrorKind::DataCorruption => "broken file",
            ErrorKind::DuplicateRecord => "record duplication",
            ErrorKind::RecordNotFound => "no record",
            ErrorKind::LogicConflict => "logical inconsistency",
            ErrorKind::SystemError => "system error",
            ErrorKind::Miscellaneous => "miscellaneous error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codename())
    }
}

/// An error reported by the storage engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RecordNotFound, message)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::RecordNotFound
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::RepositoryMissing,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::SystemError,
        };
        EngineError::new(kind, e.to_string())
    }
}

// =============================================================================
// Crate Error
// =============================================================================

/// Unified error type for AtlasCab operations
#[derive(Debug, Error)]
pub enum AtlasError {
    // -------------------------------------------------------------------------
    // Engine Errors
    // -------------------------------------------------------------------------
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// One or more index entries already belong to a different owner.
    /// Nothing from the transaction was committed.
    #[error("index conflict on {} entries", errors.len())]
    IndexConflict { errors: IndexErrors },

    // -------------------------------------------------------------------------
    // Submission Errors (reported synchronously, never scheduled)
    // -------------------------------------------------------------------------
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}: database is closed")]
    Closed(&'static str),

    #[error("request queue is full")]
    QueueFull,

    // -------------------------------------------------------------------------
    // Dispatch Errors
    // -------------------------------------------------------------------------
    #[error("worker pool disconnected")]
    Disconnected,

    #[error("unexpected reply for {0}")]
    UnexpectedReply(&'static str),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl AtlasError {
    /// Classify this error in engine terms
    pub fn kind(&self) -> ErrorKind {
        match self {
            AtlasError::Engine(e) => e.kind,
            AtlasError::IndexConflict { .. } => ErrorKind::LogicConflict,
            AtlasError::InvalidRequest(_) | AtlasError::Closed(_) | AtlasError::Config(_) => {
                ErrorKind::InvalidInput
            }
            AtlasError::QueueFull | AtlasError::Disconnected => ErrorKind::SystemError,
            AtlasError::UnexpectedReply(_) => ErrorKind::Miscellaneous,
        }
    }

    /// The engine error, if this is one
    pub fn as_engine(&self) -> Option<&EngineError> {
        match self {
            AtlasError::Engine(e) => Some(e),
            _ => None,
        }
    }

    /// The conflicting index entries, if this is an index conflict
    pub fn index_errors(&self) -> Option<&IndexErrors> {
        match self {
            AtlasError::IndexConflict { errors } => Some(errors),
            _ => None,
        }
    }
}
