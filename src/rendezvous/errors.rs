//! Rendezvous for a token's error records.
//!
//! Unlike offsets, "no errors yet" is a complete answer: every `get` drains
//! whatever is stored at that moment and never waits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::record::ErrorRecord;
use crate::storage::{EntityKind, StorageError, TokenStore};
use crate::token::Token;

use super::controller::{Absent, RendezvousController, RendezvousSource, WaiterTable};

/// Drains a token's error list.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorListSource;

#[async_trait]
impl RendezvousSource for ErrorListSource {
    type Value = Vec<ErrorRecord>;
    const KIND: EntityKind = EntityKind::ErrorList;

    async fn read(&self, store: &dyn TokenStore, token: &Token) -> Result<Option<Vec<ErrorRecord>>, StorageError> {
        store.get_and_clear_error_records(token).await.map(Some)
    }

    fn on_absent(&self) -> Absent<Vec<ErrorRecord>> {
        Absent::Reply(Vec::new())
    }

    // Drained records must reach someone; put them back for the next drain.
    async fn undeliverable(&self, store: &dyn TokenStore, token: &Token, records: Vec<ErrorRecord>) {
        for record in records {
            if let Err(e) = store.put_error_record(token, record).await {
                tracing::error!(token = %token, error = %e, "lost drained error record");
            }
        }
    }
}

/// Error-list rendezvous.
pub type ErrorRendezvous = RendezvousController<ErrorListSource>;

impl RendezvousController<ErrorListSource> {
    /// Builds the error-list rendezvous over `store`.
    pub fn for_errors(store: Arc<dyn TokenStore>, waiters: Arc<WaiterTable>) -> Self {
        Self::new(ErrorListSource, store, waiters)
    }

    /// Record an upstream failure for `token`.
    ///
    /// # Errors
    /// Returns the store error if the append fails.
    pub async fn set(&self, token: &Token, record: ErrorRecord) -> Result<(), StorageError> {
        let service = record.service_name.clone();
        self.store.put_error_record(token, record).await?;
        tracing::debug!(token = %token, service = %service, "error record published");
        self.notify(token);
        Ok(())
    }
}
