//! Configuration for AtlasCab
//!
//! Centralized configuration with sensible defaults.

use crate::error::{AtlasError, Result};
use crate::types::OpenMode;

/// Main configuration for an AtlasCab event loop and database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Dispatch Configuration
    // -------------------------------------------------------------------------
    /// Number of worker threads executing store operations
    pub worker_threads: usize,

    /// Max requests queued for the workers (None = unbounded)
    /// A full queue rejects the submission instead of blocking the caller.
    pub queue_capacity: Option<usize>,

    /// Name given to worker threads
    pub thread_name: String,

    // -------------------------------------------------------------------------
    // Store Configuration
    // -------------------------------------------------------------------------
    /// Store location
    ///   "-", "+", ":memory:"  → memory only
    ///   anything else         → snapshot file
    pub path: String,

    /// Open mode flags
    pub open_mode: OpenMode,

    // -------------------------------------------------------------------------
    // Cursor Configuration
    // -------------------------------------------------------------------------
    /// Largest key block a cursor may read in one request
    pub max_key_block: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            queue_capacity: None,
            thread_name: "atlascab-worker".to_string(),
            path: "+".to_string(),
            open_mode: OpenMode::WRITER | OpenMode::CREATE,
            max_key_block: 1 << 16,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the config for values the event loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(AtlasError::Config(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(AtlasError::Config(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.max_key_block == 0 {
            return Err(AtlasError::Config(
                "max_key_block must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of worker threads
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Bound the request queue
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    /// Set the worker thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Set the store path
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the open mode
    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.config.open_mode = mode;
        self
    }

    /// Set the largest cursor key block
    pub fn max_key_block(mut self, size: usize) -> Self {
        self.config.max_key_block = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
