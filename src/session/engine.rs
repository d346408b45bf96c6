//! Session protocol engine.
//!
//! A session zips the client's CTS stream with the logical response sequence:
//! the Nth CTS is answered by the Nth response, in order, without loss or
//! duplication. `PING`s are answered immediately and never touch the pairing.
//! Unknown client frames are dropped.
//!
//! The response sequence is only polled while at least one CTS is
//! outstanding, so an unanswered item is never pulled from the feed. Ending
//! the incoming stream (client disconnect) drops the sequence, which cancels
//! any outstanding rendezvous wait and closes the feed subscription. Error
//! records drained but not yet sent are put back in the store for the next
//! session on the token.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::audit::{AuditRecord, AuditSink};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::feed::ResultFeed;
use crate::protocol::{ClientMessage, Frame, ServerMessage, RELAY_SERVICE, SEQUENCE_HEADER};
use crate::record::{ErrorRecord, FilteredResult};
use crate::rendezvous::{ErrorRendezvous, OffsetRendezvous, WaiterTable};
use crate::storage::{StorageError, TokenStore};
use crate::token::{Offset, Token};

use super::pending::PendingErrors;
use super::sequence::{response_sequence, Response, Sequence, Sources};
use super::state::{Phase, SessionState, SessionSummary};

/// Shared session machinery: rendezvous controllers, feed and audit sink.
///
/// Cheap to clone; every session and every ingest path shares one engine.
#[derive(Clone)]
pub struct SessionEngine {
    sources: Sources,
    audit: Arc<dyn AuditSink>,
    config: RelayConfig,
}

impl std::fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEngine")
            .field("offsets", &self.sources.offsets)
            .field("errors", &self.sources.errors)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionEngine {
    /// Wire an engine over `store`, `feed` and `audit`.
    ///
    /// # Errors
    /// Returns a validation error if `config` is invalid.
    pub fn new(
        store: Arc<dyn TokenStore>,
        feed: Arc<dyn ResultFeed>,
        audit: Arc<dyn AuditSink>,
        config: RelayConfig,
    ) -> Result<Self, RelayError> {
        let config = config.validate()?;
        let offsets = OffsetRendezvous::for_offsets(
            Arc::clone(&store),
            config.rendezvous.clone(),
            Arc::new(WaiterTable::new()),
        );
        let errors = ErrorRendezvous::for_errors(store, Arc::new(WaiterTable::new()));
        Ok(Self {
            sources: Sources { offsets, errors, feed },
            audit,
            config,
        })
    }

    /// The validated configuration.
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Offset rendezvous shared by every session.
    #[must_use]
    pub fn offsets(&self) -> &OffsetRendezvous {
        &self.sources.offsets
    }

    /// Error-list rendezvous shared by every session.
    #[must_use]
    pub fn errors(&self) -> &ErrorRendezvous {
        &self.sources.errors
    }

    /// Offset-publication input.
    ///
    /// # Errors
    /// Returns the store error if the offset could not be written.
    pub async fn publish_offset(&self, token: &Token, offset: Offset) -> Result<(), StorageError> {
        self.sources.offsets.set(token, offset).await
    }

    /// Error-publication input.
    ///
    /// # Errors
    /// Returns the store error if the record could not be written.
    pub async fn publish_error(&self, record: ErrorRecord) -> Result<(), StorageError> {
        let token = record.token.clone();
        self.sources.errors.set(&token, record).await
    }

    /// Drive one client connection for `token` until the client goes away.
    ///
    /// Frames for the client are pushed into `outgoing`; a closed `outgoing`
    /// ends the session as well.
    pub async fn run<I>(&self, token: Token, incoming: I, outgoing: mpsc::Sender<Frame>) -> SessionSummary
    where
        I: Stream<Item = ClientMessage> + Send,
    {
        let session = Session {
            state: SessionState::new(token.clone()),
            audit: Arc::clone(&self.audit),
            outgoing,
        };
        let pending = PendingErrors::new(token.clone(), Arc::clone(self.sources.errors.store()));
        let responses = response_sequence(self.sources.clone(), token.clone(), pending.clone());
        let summary = session.run(incoming, responses).await;

        let restored = pending.restore().await;
        if restored > 0 {
            tracing::info!(token = %token, restored, "undelivered error records returned to the store");
        }
        summary
    }
}

struct Session {
    state: SessionState,
    audit: Arc<dyn AuditSink>,
    outgoing: mpsc::Sender<Frame>,
}

/// The transport is gone; stop.
struct Disconnected;

impl Session {
    async fn run<I>(mut self, incoming: I, mut responses: Sequence) -> SessionSummary
    where
        I: Stream<Item = ClientMessage> + Send,
    {
        let token = self.state.token().clone();
        tracing::debug!(token = %token, "session opened");
        let mut incoming = std::pin::pin!(incoming);

        loop {
            tokio::select! {
                msg = incoming.next() => {
                    let Some(msg) = msg else {
                        break;
                    };
                    if self.on_client_message(msg).await.is_err() {
                        break;
                    }
                }
                next = responses.next(), if self.state.wants_response() => {
                    let Some((phase, response)) = next else {
                        // The sequence always ends with COMPLETE; treat early exhaustion the same way.
                        tracing::error!(token = %token, "response sequence ended without COMPLETE");
                        self.state.on_response(Phase::Complete);
                        if self.send(ServerMessage::Complete, None).await.is_err() {
                            break;
                        }
                        continue;
                    };
                    let seq = self.state.on_response(phase);
                    if self.emit(response, seq).await.is_err() {
                        break;
                    }
                }
            }
        }

        let summary = self.state.summary();
        tracing::debug!(
            token = %token,
            emitted = summary.emitted,
            pongs = summary.pongs,
            complete = summary.complete,
            "session closed"
        );
        summary
    }

    async fn on_client_message(&mut self, msg: ClientMessage) -> Result<(), Disconnected> {
        match msg {
            ClientMessage::Ping => {
                self.state.on_pong();
                self.send(ServerMessage::Pong, None).await
            }
            ClientMessage::Cts => {
                if !self.state.on_cts() {
                    tracing::debug!(token = %self.state.token(), "CTS after COMPLETE ignored");
                }
                Ok(())
            }
            ClientMessage::Unknown(kind) => {
                tracing::debug!(token = %self.state.token(), kind = %kind, "discarding unknown client frame");
                Ok(())
            }
        }
    }

    async fn emit(&mut self, response: Response, seq: u64) -> Result<(), Disconnected> {
        match response {
            Response::Resource(result) => self.deliver(result, seq).await,
            Response::Error { service, message, receipt } => {
                self.send(ServerMessage::Error { service, message }, Some(seq)).await?;
                if let Some(receipt) = receipt {
                    receipt.delivered();
                }
                Ok(())
            }
            Response::Complete => {
                tracing::debug!(token = %self.state.token(), "session complete");
                self.send(ServerMessage::Complete, Some(seq)).await
            }
        }
    }

    /// Audit, send, then commit. The audit write is initiated before the frame leaves.
    async fn deliver(&mut self, result: FilteredResult, seq: u64) -> Result<(), Disconnected> {
        let FilteredResult { token, resource, commit } = result;

        let frame = match ServerMessage::Resource(resource.clone()).to_frame(&token) {
            Ok(frame) => with_sequence(frame, Some(seq)),
            Err(e) => {
                tracing::error!(token = %token, error = %e, "failed to encode resource");
                commit.release();
                let message = ServerMessage::Error {
                    service: RELAY_SERVICE.to_string(),
                    message: format!("failed to encode resource: {e}"),
                };
                return self.send(message, Some(seq)).await;
            }
        };

        let ack = self.audit.submit(AuditRecord::new(token.clone(), resource, frame.headers.clone()));
        let audit_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = ack.await {
                tracing::warn!(token = %audit_token, error = %e, "audit write failed");
            }
        });

        if self.outgoing.send(frame).await.is_err() {
            commit.release();
            return Err(Disconnected);
        }
        commit.commit();
        Ok(())
    }

    async fn send(&self, message: ServerMessage, seq: Option<u64>) -> Result<(), Disconnected> {
        let token = self.state.token();
        let frame = match message.to_frame(token) {
            Ok(frame) => with_sequence(frame, seq),
            Err(e) => {
                // Only RESOURCE bodies can fail to encode, and those go through `deliver`.
                tracing::error!(token = %token, error = %e, "failed to encode frame");
                return Ok(());
            }
        };
        self.outgoing.send(frame).await.map_err(|_| Disconnected)
    }
}

fn with_sequence(mut frame: Frame, seq: Option<u64>) -> Frame {
    if let Some(seq) = seq {
        frame.headers.insert(SEQUENCE_HEADER.to_string(), seq.to_string());
    }
    frame
}
