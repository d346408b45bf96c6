//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of
//! [`TokenStore`]. It is intended for embedded usage, tests, and as a
//! reference implementation. The durable backend reuses [`StoreState`] as its
//! index and only adds a write-ahead log around it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TtlConfig;
use crate::record::ErrorRecord;
use crate::storage::clock::{add_ttl, Clock, SystemClock};
use crate::storage::traits::{EntityKind, LeaseId, StorageError, TokenStore};
use crate::token::{Offset, Token};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// A stored value and the instant it stops being readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expiring<T> {
    /// The stored value.
    pub value: T,
    /// Instant after which the value reads as absent.
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Lease {
    kind: EntityKind,
    token: Token,
    until: DateTime<Utc>,
}

/// TTL-aware index shared by the in-memory and durable stores.
///
/// All methods are synchronous and take `now` explicitly so that WAL replay
/// can re-apply mutations at the instant they were originally made.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    offsets: HashMap<Token, Expiring<Offset>>,
    errors: HashMap<Token, Expiring<Vec<ErrorRecord>>>,
    markers: HashMap<(EntityKind, Token), DateTime<Utc>>,
    leases: HashMap<LeaseId, Lease>,
}

impl StoreState {
    fn pinned(&self, kind: EntityKind, token: &Token, now: DateTime<Utc>) -> bool {
        self.leases
            .values()
            .any(|l| l.kind == kind && &l.token == token && l.until > now)
    }

    fn live<T>(&self, kind: EntityKind, token: &Token, entry: &Expiring<T>, now: DateTime<Utc>) -> bool {
        entry.expires_at > now || self.pinned(kind, token, now)
    }

    pub fn put_offset(&mut self, token: &Token, offset: Offset, now: DateTime<Utc>, ttl: &TtlConfig) {
        self.offsets.insert(
            token.clone(),
            Expiring {
                value: offset,
                expires_at: add_ttl(now, ttl.offset_ttl),
            },
        );
    }

    pub fn get_offset(&self, token: &Token, now: DateTime<Utc>) -> Option<Offset> {
        self.offsets
            .get(token)
            .filter(|e| self.live(EntityKind::Offset, token, *e, now))
            .map(|e| e.value)
    }

    pub fn delete_offset(&mut self, token: &Token) -> bool {
        self.offsets.remove(token).is_some()
    }

    pub fn push_error(&mut self, token: &Token, record: ErrorRecord, now: DateTime<Utc>, ttl: &TtlConfig) {
        let expires_at = add_ttl(now, ttl.error_ttl);
        let pinned = self.pinned(EntityKind::ErrorList, token, now);
        let entry = self.errors.entry(token.clone()).or_insert_with(|| Expiring {
            value: Vec::new(),
            expires_at,
        });
        // Records left over from an expired list are not resurrected.
        if entry.expires_at <= now && !pinned {
            entry.value.clear();
        }
        entry.value.push(record);
        entry.expires_at = expires_at;
    }

    pub fn take_errors(&mut self, token: &Token, now: DateTime<Utc>) -> Vec<ErrorRecord> {
        let live = self
            .errors
            .get(token)
            .is_some_and(|e| self.live(EntityKind::ErrorList, token, e, now));
        match self.errors.remove(token) {
            Some(entry) if live => entry.value,
            _ => Vec::new(),
        }
    }

    pub fn mark_complete(&mut self, kind: EntityKind, token: &Token, now: DateTime<Utc>, ttl: &TtlConfig) {
        self.markers
            .insert((kind, token.clone()), add_ttl(now, ttl.marker_ttl));
        // A drain already removed the records it resolved; anything listed now
        // was appended afterwards and keeps the full error TTL.
        if kind == EntityKind::Offset {
            if let Some(entry) = self.offsets.get_mut(token) {
                entry.expires_at = add_ttl(now, ttl.resolved_ttl);
            }
        }
    }

    pub fn is_complete(&self, kind: EntityKind, token: &Token, now: DateTime<Utc>) -> bool {
        self.markers
            .get(&(kind, token.clone()))
            .is_some_and(|until| *until > now)
    }

    pub fn pin(&mut self, lease: LeaseId, kind: EntityKind, token: &Token, until: DateTime<Utc>) {
        self.leases.insert(
            lease,
            Lease {
                kind,
                token: token.clone(),
                until,
            },
        );
    }

    pub fn unpin(&mut self, lease: LeaseId) -> bool {
        self.leases.remove(&lease).is_some()
    }

    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.leases.retain(|_, l| l.until > now);

        let expired_offsets: Vec<Token> = self
            .offsets
            .iter()
            .filter(|&(t, e)| !self.live(EntityKind::Offset, t, e, now))
            .map(|(t, _)| t.clone())
            .collect();
        let expired_errors: Vec<Token> = self
            .errors
            .iter()
            .filter(|&(t, e)| !self.live(EntityKind::ErrorList, t, e, now))
            .map(|(t, _)| t.clone())
            .collect();

        let mut removed = 0;
        for token in &expired_offsets {
            removed += usize::from(self.offsets.remove(token).is_some());
        }
        for token in &expired_errors {
            removed += usize::from(self.errors.remove(token).is_some());
        }

        let before = self.markers.len();
        self.markers.retain(|_, until| *until > now);
        removed + (before - self.markers.len())
    }

    /// Snapshot of live entries, used when compacting the write-ahead log.
    #[cfg_attr(not(feature = "persistent"), allow(dead_code))]
    pub fn snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        StateSnapshot {
            offsets: self
                .offsets
                .iter()
                .filter(|&(t, e)| self.live(EntityKind::Offset, t, e, now))
                .map(|(t, e)| (t.clone(), e.clone()))
                .collect(),
            errors: self
                .errors
                .iter()
                .filter(|&(t, e)| self.live(EntityKind::ErrorList, t, e, now))
                .map(|(t, e)| (t.clone(), e.clone()))
                .collect(),
            markers: self
                .markers
                .iter()
                .filter(|(_, until)| **until > now)
                .map(|((k, t), until)| (*k, t.clone(), *until))
                .collect(),
        }
    }

    /// Reinstate entries from a snapshot. Leases are process-local and never restored.
    #[cfg_attr(not(feature = "persistent"), allow(dead_code))]
    pub fn restore(&mut self, snapshot: StateSnapshot) {
        for (token, entry) in snapshot.offsets {
            self.offsets.insert(token, entry);
        }
        for (token, entry) in snapshot.errors {
            self.errors.insert(token, entry);
        }
        for (kind, token, until) in snapshot.markers {
            self.markers.insert((kind, token), until);
        }
    }
}

/// Serializable view of the live contents of a [`StoreState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Live offsets.
    pub offsets: Vec<(Token, Expiring<Offset>)>,
    /// Live error lists.
    pub errors: Vec<(Token, Expiring<Vec<ErrorRecord>>)>,
    /// Unexpired completeness markers.
    pub markers: Vec<(EntityKind, Token, DateTime<Utc>)>,
}

/// Thread-safe in-memory token store.
#[derive(Debug)]
pub struct InMemoryTokenStore {
    state: RwLock<StoreState>,
    ttl: TtlConfig,
    clock: Arc<dyn Clock>,
}

impl InMemoryTokenStore {
    /// Create a new empty store using the system clock.
    #[must_use]
    pub fn new(ttl: TtlConfig) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create a new empty store with an explicit time source.
    #[must_use]
    pub fn with_clock(ttl: TtlConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            ttl,
            clock,
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new(TtlConfig::default())
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn put_offset(&self, token: &Token, offset: Offset) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| lock_err("offset.put"))?;
        state.put_offset(token, offset, now, &self.ttl);
        Ok(())
    }

    async fn get_offset(&self, token: &Token) -> Result<Option<Offset>, StorageError> {
        let now = self.clock.now();
        let state = self.state.read().map_err(|_| lock_err("offset.get"))?;
        Ok(state.get_offset(token, now))
    }

    async fn delete_offset(&self, token: &Token) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("offset.delete"))?;
        Ok(state.delete_offset(token))
    }

    async fn put_error_record(&self, token: &Token, record: ErrorRecord) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| lock_err("errors.put"))?;
        state.push_error(token, record, now, &self.ttl);
        Ok(())
    }

    async fn get_and_clear_error_records(&self, token: &Token) -> Result<Vec<ErrorRecord>, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| lock_err("errors.drain"))?;
        Ok(state.take_errors(token, now))
    }

    async fn mark_complete(&self, kind: EntityKind, token: &Token) -> Result<(), StorageError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| lock_err("marker.put"))?;
        state.mark_complete(kind, token, now, &self.ttl);
        Ok(())
    }

    async fn is_complete(&self, kind: EntityKind, token: &Token) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let state = self.state.read().map_err(|_| lock_err("marker.get"))?;
        Ok(state.is_complete(kind, token, now))
    }

    async fn pin(&self, kind: EntityKind, token: &Token, until: DateTime<Utc>) -> Result<LeaseId, StorageError> {
        let lease = LeaseId::new();
        let mut state = self.state.write().map_err(|_| lock_err("lease.pin"))?;
        state.pin(lease, kind, token, until);
        Ok(lease)
    }

    async fn unpin(&self, lease: LeaseId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("lease.unpin"))?;
        state.unpin(lease);
        Ok(())
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("evict"))?;
        Ok(state.evict_expired(now))
    }
}
