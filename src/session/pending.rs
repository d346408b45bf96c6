//! Error records a session has drained but not yet put on the wire.
//!
//! Draining takes records out of the store before the client has seen them.
//! Each drained record sits in the session's [`PendingErrors`] until the frame
//! carrying it is sent; whatever is still held when the session ends is
//! appended back to the store so the next session for the token drains it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::record::ErrorRecord;
use crate::storage::TokenStore;
use crate::token::Token;

struct Slots {
    token: Token,
    store: Arc<dyn TokenStore>,
    records: Mutex<Vec<Option<ErrorRecord>>>,
}

impl fmt::Debug for Slots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slots")
            .field("token", &self.token)
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl Slots {
    fn records(&self) -> MutexGuard<'_, Vec<Option<ErrorRecord>>> {
        // Slots are only ever filled or cleared; a panic mid-update leaves them usable.
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_undelivered(&self) -> Vec<ErrorRecord> {
        self.records().iter_mut().filter_map(Option::take).collect()
    }
}

impl Drop for Slots {
    fn drop(&mut self) {
        let records = self.take_undelivered();
        if records.is_empty() {
            return;
        }
        let token = self.token.clone();
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { put_back(store.as_ref(), &token, records).await });
            }
            Err(_) => {
                tracing::error!(token = %token, lost = records.len(), "no runtime to restore drained error records");
            }
        }
    }
}

/// Drained, undelivered error records for one session.
#[derive(Debug, Clone)]
pub struct PendingErrors {
    slots: Arc<Slots>,
}

/// Marks one held record as delivered.
///
/// Dropping a receipt without calling [`ErrorReceipt::delivered`] leaves the
/// record held, so it is restored when the session ends.
#[derive(Debug)]
pub struct ErrorReceipt {
    slots: Arc<Slots>,
    slot: usize,
}

impl ErrorReceipt {
    /// The frame carrying the record has been sent.
    pub fn delivered(self) {
        if let Some(record) = self.slots.records().get_mut(self.slot) {
            *record = None;
        }
    }
}

impl PendingErrors {
    /// Empty holder for `token`'s session.
    #[must_use]
    pub fn new(token: Token, store: Arc<dyn TokenStore>) -> Self {
        Self {
            slots: Arc::new(Slots {
                token,
                store,
                records: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Hold freshly drained records, returning each with its receipt.
    pub fn hold(&self, records: Vec<ErrorRecord>) -> Vec<(ErrorRecord, ErrorReceipt)> {
        let mut slots = self.slots.records();
        records
            .into_iter()
            .map(|record| {
                let slot = slots.len();
                slots.push(Some(record.clone()));
                let receipt = ErrorReceipt {
                    slots: Arc::clone(&self.slots),
                    slot,
                };
                (record, receipt)
            })
            .collect()
    }

    /// Number of held records not yet delivered.
    #[must_use]
    pub fn undelivered(&self) -> usize {
        self.slots.records().iter().filter(|r| r.is_some()).count()
    }

    /// Append every undelivered record back to the store, in drain order.
    ///
    /// Returns how many were put back.
    pub async fn restore(&self) -> usize {
        let records = self.slots.take_undelivered();
        let count = records.len();
        if count > 0 {
            put_back(self.slots.store.as_ref(), &self.slots.token, records).await;
        }
        count
    }
}

async fn put_back(store: &dyn TokenStore, token: &Token, records: Vec<ErrorRecord>) {
    let count = records.len();
    for record in records {
        if let Err(e) = store.put_error_record(token, record).await {
            tracing::error!(token = %token, error = %e, "lost undelivered error record");
        }
    }
    tracing::debug!(token = %token, count, "undelivered error records restored");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::InMemoryTokenStore;

    fn setup() -> (Arc<InMemoryTokenStore>, Token, PendingErrors) {
        let store = Arc::new(InMemoryTokenStore::default());
        let t = Token::new("t").unwrap();
        let pending = PendingErrors::new(t.clone(), Arc::clone(&store) as Arc<dyn TokenStore>);
        (store, t, pending)
    }

    fn records(t: &Token, n: usize) -> Vec<ErrorRecord> {
        (0..n).map(|i| ErrorRecord::new(t.clone(), "svc", format!("e{i}"))).collect()
    }

    #[tokio::test]
    async fn delivered_records_are_not_restored() {
        let (store, t, pending) = setup();
        let mut held = pending.hold(records(&t, 3)).into_iter();

        held.next().unwrap().1.delivered();
        assert_eq!(pending.undelivered(), 2);

        drop(held);
        assert_eq!(pending.restore().await, 2);

        let back = store.get_and_clear_error_records(&t).await.unwrap();
        let messages: Vec<_> = back.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let (store, t, pending) = setup();
        drop(pending.hold(records(&t, 2)));

        assert_eq!(pending.restore().await, 2);
        assert_eq!(pending.restore().await, 0);
        assert_eq!(store.get_and_clear_error_records(&t).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dropping_the_last_handle_restores_in_the_background() {
        let (store, t, pending) = setup();
        let held = pending.hold(records(&t, 1));
        drop(pending);
        drop(held);

        for _ in 0..100 {
            tokio::task::yield_now().await;
            if !store.get_and_clear_error_records(&t).await.unwrap().is_empty() {
                return;
            }
        }
        panic!("held record was not restored");
    }
}
