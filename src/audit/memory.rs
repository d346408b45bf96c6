use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::{self, FutureExt};

use super::traits::{AuditAck, AuditError, AuditRecord, AuditSink};

#[derive(Debug, Default)]
struct State {
    records: Vec<AuditRecord>,
    failure: Option<String>,
}

/// Audit sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    state: Mutex<State>,
}

impl MemoryAuditSink {
    /// An empty sink that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records accepted so far, in submission order.
    #[must_use]
    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().records.clone()
    }

    /// Number of records accepted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether nothing has been accepted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject every later submission with `message` (`None` to recover).
    pub fn set_failure(&self, message: Option<String>) {
        self.lock().failure = message;
    }
}

impl AuditSink for MemoryAuditSink {
    fn submit(&self, record: AuditRecord) -> AuditAck {
        let mut state = self.lock();
        let outcome = match &state.failure {
            Some(message) => Err(AuditError::Write {
                message: message.clone(),
            }),
            None => {
                state.records.push(record);
                Ok(())
            }
        };
        future::ready(outcome).boxed()
    }
}
