//! In-memory partitioned feed.
//!
//! One append-only partition per token, addressed by position. Open streams
//! tail the partition live until it is ended. Commits are tracked per token so
//! callers can see how far delivery got. Faults can be injected per token for
//! tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use crate::record::{CommitHandle, CommitOutcome, FilteredResult, ResourceDescriptor};
use crate::token::{Offset, Token};

use super::traits::{failed, FeedError, FeedStream, ResultFeed};

#[derive(Debug, Default)]
struct Partition {
    items: Vec<ResourceDescriptor>,
    ended: bool,
    committed: BTreeSet<u64>,
    released: u64,
    open_failure: Option<String>,
    read_failures: HashMap<u64, String>,
}

#[derive(Debug, Default)]
struct Shared {
    partitions: Mutex<HashMap<Token, Partition>>,
    appended: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<Token, Partition>> {
        self.partitions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_outcome(&self, token: &Token, offset: Offset, outcome: CommitOutcome) {
        let mut partitions = self.lock();
        let partition = partitions.entry(token.clone()).or_default();
        match outcome {
            CommitOutcome::Committed => {
                partition.committed.insert(offset.value());
            }
            CommitOutcome::Dropped => partition.released += 1,
        }
    }
}

/// Thread-safe in-memory [`ResultFeed`].
///
/// Cloning yields another handle to the same partitions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFeed {
    shared: Arc<Shared>,
}

impl InMemoryFeed {
    /// Create an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resource to `token`'s partition and return its offset.
    pub fn append(&self, token: &Token, resource: ResourceDescriptor) -> Offset {
        let offset = {
            let mut partitions = self.shared.lock();
            let partition = partitions.entry(token.clone()).or_default();
            partition.items.push(resource);
            Offset::new(partition.items.len() as u64 - 1)
        };
        self.shared.appended.notify_waiters();
        offset
    }

    /// Signal end-of-partition: open streams finish once they reach the end.
    pub fn end(&self, token: &Token) {
        self.shared.lock().entry(token.clone()).or_default().ended = true;
        self.shared.appended.notify_waiters();
    }

    /// First offset not yet committed (everything below it has been delivered).
    #[must_use]
    pub fn committed_offset(&self, token: &Token) -> Offset {
        let partitions = self.shared.lock();
        let Some(partition) = partitions.get(token) else {
            return Offset::ZERO;
        };
        let mut next = 0;
        while partition.committed.contains(&next) {
            next += 1;
        }
        Offset::new(next)
    }

    /// Number of items handed out and then given back undelivered.
    #[must_use]
    pub fn released(&self, token: &Token) -> u64 {
        self.shared.lock().get(token).map_or(0, |p| p.released)
    }

    /// Make every subsequent `open` for `token` fail.
    pub fn fail_open(&self, token: &Token, message: impl Into<String>) {
        self.shared.lock().entry(token.clone()).or_default().open_failure = Some(message.into());
    }

    /// Make reading `offset` of `token` yield an error (once per stream) instead of the item.
    pub fn fail_read(&self, token: &Token, offset: Offset, message: impl Into<String>) {
        self.shared
            .lock()
            .entry(token.clone())
            .or_default()
            .read_failures
            .insert(offset.value(), message.into());
    }
}

struct Cursor {
    shared: Arc<Shared>,
    token: Token,
    next: u64,
    failed_at: Option<u64>,
}

enum Poll {
    Item(Result<FilteredResult, FeedError>),
    Ended,
    Pending,
}

impl Cursor {
    fn poll(&mut self) -> Poll {
        let partitions = self.shared.lock();
        let Some(partition) = partitions.get(&self.token) else {
            return Poll::Pending;
        };

        if self.failed_at != Some(self.next) {
            if let Some(message) = partition.read_failures.get(&self.next) {
                self.failed_at = Some(self.next);
                return Poll::Item(Err(FeedError::Read {
                    offset: Offset::new(self.next),
                    message: message.clone(),
                }));
            }
        }

        let Ok(index) = usize::try_from(self.next) else {
            return Poll::Ended;
        };
        if let Some(resource) = partition.items.get(index) {
            let offset = Offset::new(self.next);
            self.next += 1;

            let shared = Arc::clone(&self.shared);
            let ack_token = self.token.clone();
            let commit = CommitHandle::new(offset, move |outcome| {
                shared.record_outcome(&ack_token, offset, outcome);
            });
            return Poll::Item(Ok(FilteredResult {
                token: self.token.clone(),
                resource: resource.clone(),
                commit,
            }));
        }

        if partition.ended {
            Poll::Ended
        } else {
            Poll::Pending
        }
    }
}

impl ResultFeed for InMemoryFeed {
    fn open(&self, token: &Token, from: Offset) -> FeedStream {
        if let Some(message) = self.shared.lock().get(token).and_then(|p| p.open_failure.clone()) {
            tracing::warn!(token = %token, "feed open failed: {message}");
            return failed(FeedError::Unavailable { message });
        }

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            token: token.clone(),
            next: from.value(),
            failed_at: None,
        };

        stream::unfold(cursor, |mut cursor| async move {
            let shared = Arc::clone(&cursor.shared);
            loop {
                // Registered before checking so an append in between is not missed.
                let appended = shared.appended.notified();
                match cursor.poll() {
                    Poll::Item(item) => return Some((item, cursor)),
                    Poll::Ended => return None,
                    Poll::Pending => appended.await,
                }
            }
        })
        .boxed()
    }

    fn tail(&self, token: &Token) -> Result<Offset, FeedError> {
        let partitions = self.shared.lock();
        if let Some(message) = partitions.get(token).and_then(|p| p.open_failure.clone()) {
            return Err(FeedError::Unavailable { message });
        }
        Ok(Offset::new(partitions.get(token).map_or(0, |p| p.items.len() as u64)))
    }
}
