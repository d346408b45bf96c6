//! Generic rendezvous between a reader and a value that may not exist yet.
//!
//! Every `get` spawns one short-lived worker task. The worker registers in the
//! [`WaiterTable`] *before* its first store read, so a `set` that lands between
//! the read and the wait still wakes it. A `set` always writes through to the
//! store first and only then notifies waiters, which re-read the store.
//!
//! Each worker sends exactly one reply and then exits. Its table entry is
//! removed when it exits, whether it replied, timed out or was cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{ExecutionError, RelayError};
use crate::storage::{add_ttl, EntityKind, LeaseId, StorageError, TokenStore};
use crate::token::Token;

/// Why a rendezvous `get` did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum RendezvousError {
    /// Nothing was published within the configured wait.
    #[error("no {kind} published for token within {waited_ms}ms")]
    Timeout { kind: EntityKind, waited_ms: u64 },

    /// The store failed while reading.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The worker went away without replying.
    #[error("rendezvous worker exited without replying")]
    Disconnected,
}

impl From<RendezvousError> for RelayError {
    fn from(err: RendezvousError) -> Self {
        match err {
            RendezvousError::Timeout { waited_ms, .. } => Self::Execution(ExecutionError::Timeout {
                duration_ms: waited_ms,
            }),
            RendezvousError::Storage(e) => e.into(),
            RendezvousError::Disconnected => Self::Execution(ExecutionError::Disconnected {
                path: "rendezvous_worker".to_string(),
            }),
        }
    }
}

/// What a worker does when the store has nothing for its token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Absent<V> {
    /// Wait for a `set`, up to the given duration.
    Wait(Duration),
    /// Reply immediately with a fallback value.
    Reply(V),
}

/// The per-kind half of a rendezvous: how to read, and what "absent" means.
#[async_trait]
pub trait RendezvousSource: Send + Sync + 'static {
    /// Value handed to the caller.
    type Value: Send + 'static;

    /// Store entity this source resolves; used for leases and markers.
    const KIND: EntityKind;

    /// Read the current value. `Ok(None)` means "not yet published".
    async fn read(&self, store: &dyn TokenStore, token: &Token) -> Result<Option<Self::Value>, StorageError>;

    /// Policy for the `Ok(None)` case.
    fn on_absent(&self) -> Absent<Self::Value>;

    /// Called with a value that was read but whose caller had gone away.
    async fn undeliverable(&self, _store: &dyn TokenStore, _token: &Token, _value: Self::Value) {}
}

/// Tokens to in-flight workers waiting on them.
///
/// Owned by whoever builds the controller and passed in explicitly; entries
/// exist only while a worker is waiting.
#[derive(Debug, Default)]
pub struct WaiterTable {
    waiters: Mutex<HashMap<Token, HashMap<u64, oneshot::Sender<()>>>>,
    next_id: AtomicU64,
}

impl WaiterTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Token, HashMap<u64, oneshot::Sender<()>>>> {
        // The map is always left consistent; a panic elsewhere does not corrupt it.
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, token: &Token) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().entry(token.clone()).or_default().insert(id, tx);
        Registration {
            table: Arc::clone(self),
            token: token.clone(),
            id,
            rx,
        }
    }

    fn deregister(&self, token: &Token, id: u64) {
        let mut waiters = self.lock();
        if let Some(slot) = waiters.get_mut(token) {
            slot.remove(&id);
            if slot.is_empty() {
                waiters.remove(token);
            }
        }
    }

    /// Wake every worker waiting on `token`. Returns how many were woken.
    pub fn notify(&self, token: &Token) -> usize {
        let Some(slot) = self.lock().remove(token) else {
            return 0;
        };
        slot.into_values()
            .filter_map(|tx| tx.send(()).ok())
            .count()
    }

    /// Number of workers currently waiting on `token`.
    #[must_use]
    pub fn waiting(&self, token: &Token) -> usize {
        self.lock().get(token).map_or(0, HashMap::len)
    }

    /// Number of tokens with at least one waiting worker.
    #[must_use]
    pub fn tokens(&self) -> usize {
        self.lock().len()
    }
}

struct Registration {
    table: Arc<WaiterTable>,
    token: Token,
    id: u64,
    rx: oneshot::Receiver<()>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.table.deregister(&self.token, self.id);
    }
}

/// Reply channel receiving exactly one outcome.
pub type Reply<V> = oneshot::Receiver<Result<V, RendezvousError>>;

/// Resolves `get(token)` requests for one [`RendezvousSource`].
pub struct RendezvousController<S: RendezvousSource> {
    pub(super) source: Arc<S>,
    pub(super) store: Arc<dyn TokenStore>,
    pub(super) waiters: Arc<WaiterTable>,
}

impl<S: RendezvousSource> Clone for RendezvousController<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            waiters: Arc::clone(&self.waiters),
        }
    }
}

impl<S: RendezvousSource> std::fmt::Debug for RendezvousController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousController")
            .field("kind", &S::KIND)
            .field("waiting_tokens", &self.waiters.tokens())
            .finish_non_exhaustive()
    }
}

impl<S: RendezvousSource> RendezvousController<S> {
    /// Builds a controller over `store`, tracking waiters in `waiters`.
    pub fn new(source: S, store: Arc<dyn TokenStore>, waiters: Arc<WaiterTable>) -> Self {
        Self {
            source: Arc::new(source),
            store,
            waiters,
        }
    }

    /// The waiter table this controller registers in.
    #[must_use]
    pub fn waiters(&self) -> &Arc<WaiterTable> {
        &self.waiters
    }

    /// The store this controller reads and writes through.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Spawn a worker for `token` and return its reply channel.
    ///
    /// Dropping the receiver cancels the worker's wait.
    ///
    /// Must be called from within a tokio runtime.
    pub fn get(&self, token: Token) -> Reply<S::Value> {
        let (tx, rx) = oneshot::channel();
        let worker = Worker {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            waiters: Arc::clone(&self.waiters),
            token,
        };
        tokio::spawn(worker.run(tx));
        rx
    }

    /// `get` and await the reply.
    pub async fn resolve(&self, token: Token) -> Result<S::Value, RendezvousError> {
        self.get(token).await.unwrap_or(Err(RendezvousError::Disconnected))
    }

    /// Wake workers waiting on `token` after a write-through.
    pub(super) fn notify(&self, token: &Token) {
        let woken = self.waiters.notify(token);
        if woken > 0 {
            tracing::debug!(token = %token, kind = %S::KIND, woken, "woke rendezvous waiters");
        }
    }
}

struct Worker<S: RendezvousSource> {
    source: Arc<S>,
    store: Arc<dyn TokenStore>,
    waiters: Arc<WaiterTable>,
    token: Token,
}

enum Step<V> {
    Done(Result<V, RendezvousError>),
    Cancelled,
}

impl<S: RendezvousSource> Worker<S> {
    async fn run(self, mut reply: oneshot::Sender<Result<S::Value, RendezvousError>>) {
        let mut lease = None;
        let step = self.resolve(&mut reply, &mut lease).await;

        if let Some(lease) = lease {
            if let Err(e) = self.store.unpin(lease).await {
                tracing::warn!(token = %self.token, kind = %S::KIND, error = %e, "failed to release wait lease");
            }
        }

        let Step::Done(outcome) = step else {
            tracing::debug!(token = %self.token, kind = %S::KIND, "rendezvous wait cancelled by caller");
            return;
        };

        let resolved = outcome.is_ok();
        match reply.send(outcome) {
            Ok(()) if resolved => {
                if let Err(e) = self.store.mark_complete(S::KIND, &self.token).await {
                    tracing::warn!(token = %self.token, kind = %S::KIND, error = %e, "failed to write completeness marker");
                }
            }
            Ok(()) => {}
            Err(Ok(value)) => {
                tracing::debug!(token = %self.token, kind = %S::KIND, "caller gone before reply");
                self.source.undeliverable(self.store.as_ref(), &self.token, value).await;
            }
            Err(Err(_)) => {}
        }
    }

    async fn resolve(
        &self,
        reply: &mut oneshot::Sender<Result<S::Value, RendezvousError>>,
        lease: &mut Option<LeaseId>,
    ) -> Step<S::Value> {
        let started = Instant::now();
        let mut registration = self.waiters.register(&self.token);

        loop {
            let max_wait = match self.source.read(self.store.as_ref(), &self.token).await {
                Ok(Some(value)) => return Step::Done(Ok(value)),
                Err(e) => {
                    tracing::warn!(token = %self.token, kind = %S::KIND, error = %e, "rendezvous read failed");
                    return Step::Done(Err(RendezvousError::Storage(e)));
                }
                Ok(None) => match self.source.on_absent() {
                    Absent::Reply(fallback) => return Step::Done(Ok(fallback)),
                    Absent::Wait(max_wait) => max_wait,
                },
            };

            if lease.is_none() {
                *lease = self.pin(max_wait).await;
            }

            let deadline = started + max_wait;
            tokio::select! {
                biased;
                woken = &mut registration.rx => {
                    if woken.is_err() {
                        tracing::debug!(token = %self.token, "waiter slot dropped; re-reading");
                    }
                    // Re-register before re-reading so a second `set` is not missed.
                    registration = self.waiters.register(&self.token);
                }
                () = tokio::time::sleep_until(deadline) => {
                    let waited_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
                    tracing::info!(token = %self.token, kind = %S::KIND, waited_ms, "rendezvous wait timed out");
                    return Step::Done(Err(RendezvousError::Timeout { kind: S::KIND, waited_ms }));
                }
                () = reply.closed() => return Step::Cancelled,
            }
        }
    }

    async fn pin(&self, max_wait: Duration) -> Option<LeaseId> {
        match self.store.pin(S::KIND, &self.token, add_ttl(Utc::now(), max_wait)).await {
            Ok(lease) => Some(lease),
            Err(e) => {
                // The wait still works; the entry just ages out on its own TTL.
                tracing::warn!(token = %self.token, kind = %S::KIND, error = %e, "failed to pin entry for wait");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::storage::InMemoryTokenStore;
    use crate::token::Offset;

    struct Probe {
        wait: Option<Duration>,
    }

    #[async_trait]
    impl RendezvousSource for Probe {
        type Value = Offset;
        const KIND: EntityKind = EntityKind::Offset;

        async fn read(&self, store: &dyn TokenStore, token: &Token) -> Result<Option<Offset>, StorageError> {
            store.get_offset(token).await
        }

        fn on_absent(&self) -> Absent<Offset> {
            self.wait.map_or(Absent::Reply(Offset::ZERO), Absent::Wait)
        }
    }

    fn controller(wait: Option<Duration>) -> (RendezvousController<Probe>, Arc<InMemoryTokenStore>) {
        let store = Arc::new(InMemoryTokenStore::default());
        let ctl = RendezvousController::new(
            Probe { wait },
            Arc::clone(&store) as Arc<dyn TokenStore>,
            Arc::new(WaiterTable::new()),
        );
        (ctl, store)
    }

    fn token(s: &str) -> Token {
        Token::new(s).unwrap()
    }

    #[tokio::test]
    async fn present_value_is_returned_and_marked() {
        let (ctl, store) = controller(Some(Duration::from_secs(1)));
        let t = token("t");
        store.put_offset(&t, Offset::new(3)).await.unwrap();

        assert_eq!(ctl.resolve(t.clone()).await.unwrap(), Offset::new(3));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.is_complete(EntityKind::Offset, &t).await.unwrap());
        assert_eq!(ctl.waiters().tokens(), 0);
    }

    #[tokio::test]
    async fn waiting_worker_is_woken_by_notify() {
        let (ctl, store) = controller(Some(Duration::from_secs(5)));
        let t = token("t");
        let reply = ctl.get(t.clone());

        while ctl.waiters().waiting(&t) == 0 {
            tokio::task::yield_now().await;
        }
        store.put_offset(&t, Offset::new(8)).await.unwrap();
        ctl.notify(&t);

        assert_eq!(reply.await.unwrap().unwrap(), Offset::new(8));
    }

    #[tokio::test(start_paused = true)]
    async fn absent_value_times_out() {
        let (ctl, _store) = controller(Some(Duration::from_millis(250)));
        let err = ctl.resolve(token("t")).await.unwrap_err();
        assert!(matches!(err, RendezvousError::Timeout { waited_ms: 250, .. }));
        assert_eq!(ctl.waiters().tokens(), 0);
    }

    #[tokio::test]
    async fn absent_value_with_fallback_replies_immediately() {
        let (ctl, _store) = controller(None);
        assert_eq!(ctl.resolve(token("t")).await.unwrap(), Offset::ZERO);
    }

    #[tokio::test]
    async fn dropped_reply_cancels_the_wait() {
        let (ctl, _store) = controller(Some(Duration::from_secs(60)));
        let t = token("t");
        let reply = ctl.get(t.clone());
        while ctl.waiters().waiting(&t) == 0 {
            tokio::task::yield_now().await;
        }

        drop(reply);
        for _ in 0..100 {
            if ctl.waiters().waiting(&t) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ctl.waiters().waiting(&t), 0);
    }

    #[test]
    fn notify_without_waiters_is_a_no_op() {
        let table = WaiterTable::new();
        assert_eq!(table.notify(&token("nobody")), 0);
    }

    #[test]
    fn timeout_maps_to_retryable_relay_error() {
        let err: RelayError = RendezvousError::Timeout {
            kind: EntityKind::Offset,
            waited_ms: 10,
        }
        .into();
        assert!(err.is_retryable());
    }
}
