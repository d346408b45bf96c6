//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use tokenrelay::protocol::{FrameType, SERVICE_HEADER};
use tokenrelay::storage::LeaseId;
use tokenrelay::{
    AuditSink, ClientMessage, EntityKind, ErrorRecord, Frame, InMemoryFeed, InMemoryTokenStore, MemoryAuditSink,
    Offset, RelayConfig, ResultFeed, SessionEngine, SessionSummary, StorageError, Token, TokenStore,
};

/// Wraps an in-memory store and fails offset reads for chosen tokens.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: InMemoryTokenStore,
    failing: Mutex<HashSet<Token>>,
}

impl FailingStore {
    pub fn fail_offsets_for(&self, token: &Token) {
        self.failing.lock().unwrap().insert(token.clone());
    }

    fn check(&self, token: &Token) -> Result<(), StorageError> {
        if self.failing.lock().unwrap().contains(token) {
            return Err(StorageError::ConnectionError(format!("store unreachable for {token}")));
        }
        Ok(())
    }
}

#[async_trait]
impl TokenStore for FailingStore {
    async fn put_offset(&self, token: &Token, offset: Offset) -> Result<(), StorageError> {
        self.inner.put_offset(token, offset).await
    }

    async fn get_offset(&self, token: &Token) -> Result<Option<Offset>, StorageError> {
        self.check(token)?;
        self.inner.get_offset(token).await
    }

    async fn delete_offset(&self, token: &Token) -> Result<bool, StorageError> {
        self.inner.delete_offset(token).await
    }

    async fn put_error_record(&self, token: &Token, record: ErrorRecord) -> Result<(), StorageError> {
        self.inner.put_error_record(token, record).await
    }

    async fn get_and_clear_error_records(&self, token: &Token) -> Result<Vec<ErrorRecord>, StorageError> {
        self.inner.get_and_clear_error_records(token).await
    }

    async fn mark_complete(&self, kind: EntityKind, token: &Token) -> Result<(), StorageError> {
        self.inner.mark_complete(kind, token).await
    }

    async fn is_complete(&self, kind: EntityKind, token: &Token) -> Result<bool, StorageError> {
        self.inner.is_complete(kind, token).await
    }

    async fn pin(&self, kind: EntityKind, token: &Token, until: DateTime<Utc>) -> Result<LeaseId, StorageError> {
        self.inner.pin(kind, token, until).await
    }

    async fn unpin(&self, lease: LeaseId) -> Result<(), StorageError> {
        self.inner.unpin(lease).await
    }

    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        self.inner.evict_expired(now).await
    }
}

pub struct Relay {
    pub engine: SessionEngine,
    pub feed: InMemoryFeed,
    pub audit: Arc<MemoryAuditSink>,
}

pub fn relay_over(store: Arc<dyn TokenStore>, config: RelayConfig) -> Relay {
    let feed = InMemoryFeed::new();
    let audit = Arc::new(MemoryAuditSink::new());
    let engine = SessionEngine::new(
        store,
        Arc::new(feed.clone()) as Arc<dyn ResultFeed>,
        Arc::clone(&audit) as Arc<dyn AuditSink>,
        config,
    )
    .unwrap();
    Relay { engine, feed, audit }
}

pub fn relay() -> Relay {
    relay_over(Arc::new(InMemoryTokenStore::default()), RelayConfig::default())
}

pub fn token(s: &str) -> Token {
    Token::new(s).unwrap()
}

/// A client connected to a running session.
pub struct Client {
    pub tx: mpsc::Sender<ClientMessage>,
    pub rx: mpsc::Receiver<Frame>,
    pub session: JoinHandle<SessionSummary>,
}

impl Client {
    pub fn connect(engine: &SessionEngine, token: &Token) -> Self {
        let (tx, in_rx) = mpsc::channel(256);
        let (out_tx, rx) = mpsc::channel(256);
        let engine = engine.clone();
        let token = token.clone();
        let session = tokio::spawn(async move { engine.run(token, ReceiverStream::new(in_rx), out_tx).await });
        Self { tx, rx, session }
    }

    pub async fn send(&self, msg: ClientMessage) {
        self.tx.send(msg).await.unwrap();
    }

    /// Next frame, failing the test after five seconds.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session closed")
    }

    /// Whether any frame arrives within `window`.
    pub async fn quiet_for(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.rx.recv()).await.is_err()
    }

    pub async fn close(self) -> SessionSummary {
        drop(self.tx);
        self.session.await.unwrap()
    }
}

/// Short label for a frame: `R:<id>`, `E:<service>`, or the type name.
pub fn label(frame: &Frame) -> String {
    match frame.known_type() {
        Some(FrameType::Resource) => format!("R:{}", frame.body["resource_id"].as_str().unwrap_or_default()),
        Some(FrameType::Error) => format!("E:{}", frame.header(SERVICE_HEADER).unwrap_or_default()),
        Some(other) => other.to_string(),
        None => frame.frame_type.clone(),
    }
}
