//! Abstract storage contract for TokenRelay.
//!
//! The relay only needs a narrow key-value contract keyed by token:
//! - offsets (last-write-wins)
//! - append-only error lists with an atomic drain
//! - completeness markers and wait leases that drive TTL eviction
//!
//! By using a trait, we enable:
//! - In-memory backends for testing and embedded use
//! - Durable backends for restart recovery
//! - External stores (relational, document) behind the same interface

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ExecutionError, RelayError};
use crate::record::ErrorRecord;
use crate::token::{Offset, Token};

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed or the store is unavailable.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        Self::Execution(err.into())
    }
}

/// Kinds of per-token entity the store keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A token's starting offset.
    Offset,
    /// A token's pending error records.
    ErrorList,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offset => write!(f, "offset"),
            Self::ErrorList => write!(f, "error_list"),
        }
    }
}

/// Handle for a wait lease taken with [`TokenStore::pin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(uuid::Uuid);

impl LeaseId {
    /// Creates a new random lease id.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage contract for token-scoped relay state.
///
/// # Concurrency
/// - Implementations must be safe to share across tasks.
/// - No implementation may hold a lock across an `.await`.
///
/// # Expiry
/// Expired entries read as absent. An entry covered by an unexpired lease is
/// never treated as expired, regardless of its own TTL.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store the starting offset for a token. Last write wins.
    async fn put_offset(&self, token: &Token, offset: Offset) -> Result<(), StorageError>;

    /// Get the starting offset for a token, if published and not expired.
    async fn get_offset(&self, token: &Token) -> Result<Option<Offset>, StorageError>;

    /// Delete a token's offset. Returns whether one was present.
    async fn delete_offset(&self, token: &Token) -> Result<bool, StorageError>;

    /// Append an error record to the token's list.
    async fn put_error_record(&self, token: &Token, record: ErrorRecord) -> Result<(), StorageError>;

    /// Atomically take every error record currently stored for the token.
    ///
    /// A record appended concurrently is either returned here or left for
    /// the next call; it is never lost.
    async fn get_and_clear_error_records(&self, token: &Token) -> Result<Vec<ErrorRecord>, StorageError>;

    /// Record that the entity has been resolved.
    ///
    /// A resolved offset then ages out on the short post-resolution TTL.
    /// Error records still listed keep their own TTL: they were appended
    /// after the drain that resolved the list.
    async fn mark_complete(&self, kind: EntityKind, token: &Token) -> Result<(), StorageError>;

    /// Whether an unexpired completeness marker exists.
    async fn is_complete(&self, kind: EntityKind, token: &Token) -> Result<bool, StorageError>;

    /// Keep the entity alive at least until `until` while a worker waits on it.
    async fn pin(&self, kind: EntityKind, token: &Token, until: DateTime<Utc>) -> Result<LeaseId, StorageError>;

    /// Release a lease taken with [`TokenStore::pin`]. Unknown leases are ignored.
    async fn unpin(&self, lease: LeaseId) -> Result<(), StorageError>;

    /// Remove expired, unpinned entries and expired markers/leases.
    ///
    /// Returns the number of entries removed.
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}
