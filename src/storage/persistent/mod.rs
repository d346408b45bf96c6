//! Persistent storage backend for the relay.
//!
//! This module provides a durable, crash-safe [`TokenStore`] with:
//! - Write-Ahead Logging (WAL) for crash recovery
//! - File locking for single-process ownership of a data directory
//! - CRC32 checksums for corruption detection
//! - Snapshot compaction once the log grows past a threshold
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │             PersistentTokenStore             │
//! ├──────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐    │
//! │  │ WriteAheadLog   │  │ StoreState      │    │
//! │  │ (append-only)   │→ │ (TTL index)     │    │
//! │  └────────┬────────┘  └─────────────────┘    │
//! │           ↓                                  │
//! │  ┌─────────────────────┐                     │
//! │  │   FileLock (flock)  │                     │
//! │  └─────────────────────┘                     │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! [`TokenStore`]: crate::storage::TokenStore

mod codec;
mod file_lock;
mod stores;
mod wal;

pub use file_lock::FileLock;
pub use stores::PersistentTokenStore;
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use crate::config::TtlConfig;
use crate::error::RelayError;

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Maximum WAL size before compaction (bytes).
    pub max_wal_size: u64,
    /// Whether to fsync after every write (slower but safer).
    pub sync_on_write: bool,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            max_wal_size: 64 * 1024 * 1024, // 64 MB
            sync_on_write: true,
        }
    }
}

impl PersistentConfig {
    const MIN_WAL_SIZE: u64 = 4 * 1024; // 4 KiB minimum to avoid degenerate compaction loops

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns a validation error if `max_wal_size` is below 4 KiB.
    pub fn validate(self) -> Result<Self, RelayError> {
        if self.max_wal_size < Self::MIN_WAL_SIZE {
            return Err(RelayError::invalid_config(format!(
                "max_wal_size must be at least {} bytes (got {})",
                Self::MIN_WAL_SIZE,
                self.max_wal_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a durable token store at the given directory.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the directory lock
/// - If the configuration is invalid
///
/// # Example
/// ```rust,ignore
/// use tokenrelay::config::TtlConfig;
/// use tokenrelay::storage::persistent::open_store;
///
/// let store = open_store("./relay-data", TtlConfig::default(), None)?;
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    ttl: TtlConfig,
    config: Option<PersistentConfig>,
) -> Result<PersistentTokenStore, RelayError> {
    let ttl = ttl.validate()?;
    let cfg = config.unwrap_or_default().validate()?;
    PersistentTokenStore::open(path.as_ref(), ttl, cfg)
}
