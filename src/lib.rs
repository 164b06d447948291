//! # AtlasCab
//!
//! Asynchronous request dispatch over an ordered key-value store, with:
//! - Store calls executed on a worker pool, never on the caller's thread
//! - Results delivered exactly once, back on the caller's event loop
//! - Secondary indexes kept consistent with their primary records in one
//!   all-or-nothing transaction
//! - Positional cursors driven through the same request lifecycle
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Database / Cursor (caller facing)              │
//! │        validate inputs, build descriptor, keep callback     │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ submit
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                       EventLoop                             │
//! │     pending callbacks │ job queue │ completion queue        │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!                       ▼
//!               ┌───────────────┐
//!               │  Worker Pool  │
//!               └───────┬───────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌──────────────┐
//!   │   Indexed   │─────────►│ Store (trait)│
//!   │    Write    │          │ MemoryStore  │
//!   └─────────────┘          └──────┬───────┘
//!                                   │
//!                                   ▼
//!                           ┌─────────────┐
//!                           │  Snapshot   │
//!                           └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use atlascab::{Config, Database, EventLoop};
//!
//! let event_loop = EventLoop::new(Config::default())?;
//! let db = Database::new(&event_loop);
//! db.open("+", "a+", |opened| opened.expect("open"))?;
//! event_loop.run();
//!
//! db.set("greeting", "hello", |stored| stored.expect("set"))?;
//! db.get("greeting", |value| println!("{:?}", value))?;
//! event_loop.run();
//! # Ok::<(), atlascab::AtlasError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod types;

pub mod cursor;
pub mod database;
pub mod dispatch;
pub mod engine;
pub mod indexed;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use config::Config;
pub use cursor::Cursor;
pub use database::{Database, DbState};
pub use dispatch::{EventLoop, RequestId};
pub use engine::{MemoryStore, Store, StoreCursor, VisitAction, Visitor};
pub use error::{AtlasError, EngineError, ErrorKind, Result};
pub use indexed::{IndexedWrite, PrimaryWrite};
pub use types::{IndexKey, OpenMode};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of AtlasCab
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
