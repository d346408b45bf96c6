//! Rendezvous for a token's starting offset.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AbsentOffsetPolicy, RendezvousConfig};
use crate::storage::{EntityKind, StorageError, TokenStore};
use crate::token::{Offset, Token};

use super::controller::{Absent, RendezvousController, RendezvousSource, WaiterTable};

/// Where a session starts reading the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    /// The published offset.
    Offset(Offset),
    /// Whatever the feed's tail is when the session opens it.
    Tail,
}

/// Reads published offsets; waits for one or falls back to the tail when absent.
#[derive(Debug, Clone)]
pub struct OffsetSource {
    config: RendezvousConfig,
}

impl OffsetSource {
    /// An offset source following `config`.
    #[must_use]
    pub fn new(config: RendezvousConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RendezvousSource for OffsetSource {
    type Value = StartAt;
    const KIND: EntityKind = EntityKind::Offset;

    async fn read(&self, store: &dyn TokenStore, token: &Token) -> Result<Option<StartAt>, StorageError> {
        Ok(store.get_offset(token).await?.map(StartAt::Offset))
    }

    fn on_absent(&self) -> Absent<StartAt> {
        match self.config.absent_offset {
            AbsentOffsetPolicy::Wait => Absent::Wait(self.config.offset_max_wait),
            AbsentOffsetPolicy::StartFromTail => Absent::Reply(StartAt::Tail),
        }
    }
}

/// Offset rendezvous.
pub type OffsetRendezvous = RendezvousController<OffsetSource>;

impl RendezvousController<OffsetSource> {
    /// Builds the offset rendezvous over `store`.
    pub fn for_offsets(store: Arc<dyn TokenStore>, config: RendezvousConfig, waiters: Arc<WaiterTable>) -> Self {
        Self::new(OffsetSource::new(config), store, waiters)
    }

    /// Publish `offset` for `token`: write through, then wake waiters.
    ///
    /// Replaying the same event is harmless.
    ///
    /// # Errors
    /// Returns the store error if the write fails; waiters are not woken then.
    pub async fn set(&self, token: &Token, offset: Offset) -> Result<(), StorageError> {
        self.store.put_offset(token, offset).await?;
        tracing::debug!(token = %token, offset = %offset, "offset published");
        self.notify(token);
        Ok(())
    }
}
