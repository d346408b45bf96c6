//! Durable token store.
//!
//! Wraps:
//! - the shared TTL index for reads
//! - the write-ahead log for durable mutations
//! - the directory lock for single-process ownership
//!
//! File I/O runs on tokio's blocking pool so async callers never stall a
//! runtime worker on `fsync`.

use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TtlConfig;
use crate::error::{ExecutionError, RelayError};
use crate::record::ErrorRecord;
use crate::storage::clock::{Clock, SystemClock};
use crate::storage::memory::StoreState;
use crate::storage::traits::{EntityKind, LeaseId, StorageError, TokenStore};
use crate::token::{Offset, Token};

use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "relay.wal";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &'static str, err: std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

struct Inner {
    state: RwLock<StoreState>,
    wal: WriteAheadLog,
    ttl: TtlConfig,
    config: PersistentConfig,
    clock: Arc<dyn Clock>,
    _lock: FileLock,
}

impl Inner {
    /// Log then apply, under the index write lock so log order matches apply order.
    fn mutate<R>(
        &self,
        context: &'static str,
        kind: WalEntryKind,
        apply: impl FnOnce(&mut StoreState, DateTime<Utc>, &TtlConfig) -> R,
    ) -> Result<R, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| lock_err(context))?;
        self.wal.append(now, kind).map_err(|e| io_err(context, e))?;
        let out = apply(&mut state, now, &self.ttl);
        self.maybe_compact(&state, now);
        Ok(out)
    }

    fn maybe_compact(&self, state: &StoreState, now: DateTime<Utc>) {
        let size = match self.wal.size_bytes() {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "could not stat write-ahead log");
                return;
            }
        };
        if size <= self.config.max_wal_size {
            return;
        }
        match self.wal.compact(now, state.snapshot(now)) {
            Ok(()) => tracing::debug!(before = size, "compacted write-ahead log"),
            // The uncompacted log is still complete; retry on the next write.
            Err(e) => tracing::warn!(error = %e, "write-ahead log compaction failed"),
        }
    }

    fn replay(&self) -> Result<usize, StorageError> {
        let entries = self.wal.entries().map_err(|e| io_err("wal.replay", e))?;
        let mut state = self.state.write().map_err(|_| lock_err("wal.replay"))?;
        let count = entries.len();
        for entry in entries {
            let at = entry.timestamp;
            match entry.kind {
                WalEntryKind::OffsetPut { token, offset } => state.put_offset(&token, offset, at, &self.ttl),
                WalEntryKind::OffsetDelete { token } => {
                    state.delete_offset(&token);
                }
                WalEntryKind::ErrorAppend { token, record } => state.push_error(&token, record, at, &self.ttl),
                WalEntryKind::ErrorDrain { token } => {
                    state.take_errors(&token, at);
                }
                WalEntryKind::MarkComplete { kind, token } => state.mark_complete(kind, &token, at, &self.ttl),
                WalEntryKind::Snapshot(snapshot) => {
                    *state = StoreState::default();
                    state.restore(snapshot);
                }
            }
        }
        state.evict_expired(self.clock.now());
        Ok(count)
    }
}

/// Durable [`TokenStore`] backed by a write-ahead log.
#[derive(Clone)]
pub struct PersistentTokenStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PersistentTokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTokenStore")
            .field("ttl", &self.inner.ttl)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl PersistentTokenStore {
    /// Open (or create) a store in `dir`, replaying its log.
    pub fn open(dir: &Path, ttl: TtlConfig, config: PersistentConfig) -> Result<Self, RelayError> {
        Self::open_with_clock(dir, ttl, config, Arc::new(SystemClock))
    }

    /// Like [`PersistentTokenStore::open`] with an explicit time source.
    pub fn open_with_clock(
        dir: &Path,
        ttl: TtlConfig,
        config: PersistentConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RelayError> {
        let storage = |message: String| RelayError::Execution(ExecutionError::Storage { message });

        fs::create_dir_all(dir).map_err(|e| storage(format!("failed to create {}: {e}", dir.display())))?;
        let lock = FileLock::acquire(dir).map_err(|e| storage(format!("failed to lock {}: {e}", dir.display())))?;
        let wal = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| storage(format!("failed to open write-ahead log: {e}")))?;

        let inner = Inner {
            state: RwLock::new(StoreState::default()),
            wal,
            ttl,
            config,
            clock,
            _lock: lock,
        };
        let replayed = inner.replay()?;
        tracing::info!(dir = %dir.display(), replayed, "opened persistent token store");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(&Inner) -> Result<R, StorageError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StorageError::BackendError(format!("storage task failed: {e}")))?
    }
}

#[async_trait]
impl TokenStore for PersistentTokenStore {
    async fn put_offset(&self, token: &Token, offset: Offset) -> Result<(), StorageError> {
        let token = token.clone();
        self.blocking(move |inner| {
            inner.mutate(
                "offset.put",
                WalEntryKind::OffsetPut {
                    token: token.clone(),
                    offset,
                },
                |state, now, ttl| state.put_offset(&token, offset, now, ttl),
            )
        })
        .await
    }

    async fn get_offset(&self, token: &Token) -> Result<Option<Offset>, StorageError> {
        let now = self.inner.clock.now();
        let state = self.inner.state.read().map_err(|_| lock_err("offset.get"))?;
        Ok(state.get_offset(token, now))
    }

    async fn delete_offset(&self, token: &Token) -> Result<bool, StorageError> {
        let token = token.clone();
        self.blocking(move |inner| {
            inner.mutate(
                "offset.delete",
                WalEntryKind::OffsetDelete { token: token.clone() },
                |state, _, _| state.delete_offset(&token),
            )
        })
        .await
    }

    async fn put_error_record(&self, token: &Token, record: ErrorRecord) -> Result<(), StorageError> {
        let token = token.clone();
        self.blocking(move |inner| {
            inner.mutate(
                "errors.put",
                WalEntryKind::ErrorAppend {
                    token: token.clone(),
                    record: record.clone(),
                },
                |state, now, ttl| state.push_error(&token, record, now, ttl),
            )
        })
        .await
    }

    async fn get_and_clear_error_records(&self, token: &Token) -> Result<Vec<ErrorRecord>, StorageError> {
        let token = token.clone();
        self.blocking(move |inner| {
            inner.mutate(
                "errors.drain",
                WalEntryKind::ErrorDrain { token: token.clone() },
                |state, now, _| state.take_errors(&token, now),
            )
        })
        .await
    }

    async fn mark_complete(&self, kind: EntityKind, token: &Token) -> Result<(), StorageError> {
        let token = token.clone();
        self.blocking(move |inner| {
            inner.mutate(
                "marker.put",
                WalEntryKind::MarkComplete {
                    kind,
                    token: token.clone(),
                },
                |state, now, ttl| state.mark_complete(kind, &token, now, ttl),
            )
        })
        .await
    }

    async fn is_complete(&self, kind: EntityKind, token: &Token) -> Result<bool, StorageError> {
        let now = self.inner.clock.now();
        let state = self.inner.state.read().map_err(|_| lock_err("marker.get"))?;
        Ok(state.is_complete(kind, token, now))
    }

    // Leases guard a live wait; they die with the process and are not logged.
    async fn pin(&self, kind: EntityKind, token: &Token, until: DateTime<Utc>) -> Result<LeaseId, StorageError> {
        let lease = LeaseId::new();
        let mut state = self.inner.state.write().map_err(|_| lock_err("lease.pin"))?;
        state.pin(lease, kind, token, until);
        Ok(lease)
    }

    async fn unpin(&self, lease: LeaseId) -> Result<(), StorageError> {
        let mut state = self.inner.state.write().map_err(|_| lock_err("lease.unpin"))?;
        state.unpin(lease);
        Ok(())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut state = self.inner.state.write().map_err(|_| lock_err("evict"))?;
        Ok(state.evict_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tempfile::tempdir;

    use crate::storage::clock::ManualClock;

    fn token(s: &str) -> Token {
        Token::new(s).unwrap()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let t = token("t1");
        {
            let store = PersistentTokenStore::open(dir.path(), TtlConfig::default(), PersistentConfig::default())
                .unwrap();
            store.put_offset(&t, Offset::new(5)).await.unwrap();
            store
                .put_error_record(&t, ErrorRecord::new(t.clone(), "policy", "denied"))
                .await
                .unwrap();
            store.mark_complete(EntityKind::Offset, &t).await.unwrap();
        }

        let store =
            PersistentTokenStore::open(dir.path(), TtlConfig::default(), PersistentConfig::default()).unwrap();
        assert_eq!(store.get_offset(&t).await.unwrap(), Some(Offset::new(5)));
        assert!(store.is_complete(EntityKind::Offset, &t).await.unwrap());
        let errors = store.get_and_clear_error_records(&t).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].service_name, "policy");
    }

    #[tokio::test]
    async fn drained_errors_stay_drained_after_reopen() {
        let dir = tempdir().unwrap();
        let t = token("t2");
        {
            let store = PersistentTokenStore::open(dir.path(), TtlConfig::default(), PersistentConfig::default())
                .unwrap();
            store.put_error_record(&t, ErrorRecord::new(t.clone(), "s", "a")).await.unwrap();
            assert_eq!(store.get_and_clear_error_records(&t).await.unwrap().len(), 1);
        }
        let store =
            PersistentTokenStore::open(dir.path(), TtlConfig::default(), PersistentConfig::default()).unwrap();
        assert!(store.get_and_clear_error_records(&t).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ttl_keeps_counting_across_restart() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let ttl = TtlConfig {
            offset_ttl: Duration::from_secs(60),
            ..TtlConfig::default()
        };
        let t = token("t3");
        {
            let store = PersistentTokenStore::open_with_clock(
                dir.path(),
                ttl.clone(),
                PersistentConfig::default(),
                Arc::clone(&clock) as Arc<dyn Clock>,
            )
            .unwrap();
            store.put_offset(&t, Offset::new(1)).await.unwrap();
        }

        clock.advance(Duration::from_secs(61));
        let store = PersistentTokenStore::open_with_clock(
            dir.path(),
            ttl,
            PersistentConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();
        assert_eq!(store.get_offset(&t).await.unwrap(), None);
    }

    #[tokio::test]
    async fn compaction_preserves_live_state() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            max_wal_size: 4 * 1024,
            sync_on_write: false,
        };
        {
            let store = PersistentTokenStore::open(dir.path(), TtlConfig::default(), config.clone()).unwrap();
            for i in 0..200u64 {
                let t = token(&format!("token-{i}"));
                store.put_offset(&t, Offset::new(i)).await.unwrap();
            }
        }

        let store = PersistentTokenStore::open(dir.path(), TtlConfig::default(), config).unwrap();
        let entries = store.inner.wal.entries().unwrap();
        assert!(entries.len() < 200, "log was never compacted");
        assert!(matches!(entries[0].kind, WalEntryKind::Snapshot(_)));
        for i in [0u64, 57, 199] {
            let t = token(&format!("token-{i}"));
            assert_eq!(store.get_offset(&t).await.unwrap(), Some(Offset::new(i)));
        }
    }

    #[tokio::test]
    async fn second_open_of_locked_dir_fails() {
        let dir = tempdir().unwrap();
        let _first =
            PersistentTokenStore::open(dir.path(), TtlConfig::default(), PersistentConfig::default()).unwrap();
        let second = PersistentTokenStore::open(dir.path(), TtlConfig::default(), PersistentConfig::default());
        assert!(second.is_err());
    }
}
