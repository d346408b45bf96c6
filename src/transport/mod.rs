//! gRPC transport layer for TokenRelay.
//!
//! The session RPC carries the JSON-encoded `{type, headers, body}` frames of
//! [`crate::protocol`] unchanged, so the pairing rules live entirely in the
//! [`SessionEngine`]. The unary RPCs are the upstream ingest inputs: offset
//! and error publication, plus result publication into the built-in
//! [`InMemoryFeed`] when the server owns one.

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::{future, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status, Streaming};

use crate::error::{ExecutionError, RelayError, ValidationError};
use crate::feed::InMemoryFeed;
use crate::protocol::{ClientMessage, Frame, TOKEN_HEADER};
use crate::record::{ErrorRecord, ResourceDescriptor};
use crate::session::SessionEngine;
use crate::token::{Offset, Token};

pub mod proto {
    tonic::include_proto!("tokenrelay");
}

use proto::relay_server::{Relay, RelayServer};

// ----------------------------------------------------------------------------
// Limits (DoS protection)
// ----------------------------------------------------------------------------

/// Maximum size of a published resource descriptor.
const MAX_RESOURCE_JSON_BYTES: usize = 1024 * 1024; // 1 MiB

/// Maximum length of a service name or error message on the ingest RPCs.
const MAX_SERVICE_NAME_LEN: usize = 256;
const MAX_ERROR_MESSAGE_LEN: usize = 16 * 1024;

/// gRPC service implementation for TokenRelay.
#[derive(Debug, Clone)]
pub struct RelayServiceImpl {
    engine: SessionEngine,
    ingest_feed: Option<InMemoryFeed>,
}

impl RelayServiceImpl {
    /// A service over `engine` without result ingest.
    #[must_use]
    pub fn new(engine: SessionEngine) -> Self {
        Self {
            engine,
            ingest_feed: None,
        }
    }

    /// Accept `PublishResult`/`EndResults` into `feed`.
    ///
    /// Without a feed those RPCs answer `UNIMPLEMENTED`; results are then
    /// expected to arrive through whatever [`crate::feed::ResultFeed`] the
    /// engine was built over.
    #[must_use]
    pub fn with_ingest_feed(mut self, feed: InMemoryFeed) -> Self {
        self.ingest_feed = Some(feed);
        self
    }

    /// Wrap into the generated tonic server.
    #[must_use]
    pub fn into_server(self) -> RelayServer<Self> {
        RelayServer::new(self)
    }

    /// Start a session over an inbound frame stream.
    ///
    /// If `token` is `None` the first inbound frame must carry the token
    /// header. The session ends when the inbound stream ends or fails, or
    /// when the returned stream is dropped.
    pub async fn start_session<S>(&self, token: Option<Token>, mut inbound: S) -> Result<SessionStream, Status>
    where
        S: Stream<Item = Result<proto::SessionFrame, Status>> + Send + Unpin + 'static,
    {
        let (token, first) = match token {
            Some(token) => (token, None),
            None => {
                let first = match inbound.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(status)) => return Err(status),
                    None => return Err(invalid_argument("session closed before the first frame")),
                };
                let token = Frame::from_json(&first.frame_json)
                    .ok()
                    .and_then(|frame| frame.token())
                    .ok_or_else(|| invalid_argument(format!("missing {TOKEN_HEADER} metadata or frame header")))?;
                (token, Some(first))
            }
        };

        let frame_token = token.clone();
        let incoming = stream::iter(first.map(Ok))
            .chain(inbound)
            .take_while(|item| future::ready(item.is_ok()))
            .filter_map(|item| future::ready(item.ok()))
            .map(move |frame| decode_client_frame(&frame_token, &frame.frame_json));

        let (tx, rx) = mpsc::channel::<Frame>(self.engine.config().session.outbound_capacity);
        let engine = self.engine.clone();
        tokio::spawn(async move {
            let summary = engine.run(token, incoming, tx).await;
            tracing::info!(
                token = %summary.token,
                emitted = summary.emitted,
                complete = summary.complete,
                "grpc session ended"
            );
        });

        Ok(ReceiverStream::new(rx)
            .map(|frame| {
                frame
                    .to_json()
                    .map(|frame_json| proto::SessionFrame { frame_json })
                    .map_err(|e| status_from_relay_error(e.into()))
            })
            .boxed())
    }

    fn ingest_feed(&self) -> Result<&InMemoryFeed, Status> {
        self.ingest_feed
            .as_ref()
            .ok_or_else(|| Status::unimplemented("this relay does not accept published results"))
    }
}

/// Outbound frames of one session.
pub type SessionStream = BoxStream<'static, Result<proto::SessionFrame, Status>>;

fn invalid_argument(msg: impl Into<String>) -> Status {
    Status::invalid_argument(msg.into())
}

fn parse_token(s: &str) -> Result<Token, Status> {
    Token::new(s).map_err(|e| invalid_argument(e.to_string()))
}

fn token_from_metadata(metadata: &MetadataMap) -> Result<Option<Token>, Status> {
    let Some(value) = metadata.get(TOKEN_HEADER) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| invalid_argument(format!("{TOKEN_HEADER} metadata is not valid ASCII")))?;
    parse_token(value).map(Some)
}

fn require(field: &str, value: &str, max_length: usize) -> Result<(), Status> {
    if value.trim().is_empty() {
        return Err(status_from_relay_error(
            ValidationError::MissingField {
                field: field.to_string(),
            }
            .into(),
        ));
    }
    if value.len() > max_length {
        return Err(status_from_relay_error(
            ValidationError::FieldTooLong {
                field: field.to_string(),
                max_length,
            }
            .into(),
        ));
    }
    Ok(())
}

/// Frames addressed to another token are treated like unknown frames.
fn decode_client_frame(token: &Token, bytes: &[u8]) -> ClientMessage {
    let Ok(frame) = Frame::from_json(bytes) else {
        return ClientMessage::decode(bytes);
    };
    match frame.token() {
        Some(other) if &other != token => {
            tracing::debug!(token = %token, other = %other, "discarding frame for another token");
            ClientMessage::Unknown(frame.frame_type)
        }
        _ => ClientMessage::from_frame(&frame),
    }
}

fn timestamp_to_utc(ts: &prost_types::Timestamp) -> Result<DateTime<Utc>, Status> {
    let nanos = u32::try_from(ts.nanos).map_err(|_| invalid_argument("reported_at has negative nanos"))?;
    DateTime::from_timestamp(ts.seconds, nanos).ok_or_else(|| invalid_argument("reported_at out of range"))
}

fn parse_resource(bytes: &[u8]) -> Result<ResourceDescriptor, Status> {
    if bytes.is_empty() {
        return Err(invalid_argument("resource_json is required"));
    }
    if bytes.len() > MAX_RESOURCE_JSON_BYTES {
        return Err(invalid_argument("resource_json exceeds maximum size"));
    }
    serde_json::from_slice(bytes).map_err(|e| invalid_argument(format!("invalid resource JSON: {e}")))
}

fn status_from_relay_error(err: RelayError) -> Status {
    match err {
        RelayError::Validation(v) => Status::invalid_argument(v.to_string()),
        RelayError::Transport(t) => Status::unavailable(t.to_string()),
        RelayError::Internal { message } => Status::internal(message),
        RelayError::Execution(e) => match e {
            ExecutionError::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            ExecutionError::QueueFull { .. } => Status::resource_exhausted(e.to_string()),
            ExecutionError::Storage { .. } | ExecutionError::Feed { .. } | ExecutionError::Disconnected { .. } => {
                Status::unavailable(e.to_string())
            }
        },
    }
}

#[tonic::async_trait]
impl Relay for RelayServiceImpl {
    type SessionStream = SessionStream;

    async fn session(
        &self,
        request: Request<Streaming<proto::SessionFrame>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        let token = token_from_metadata(request.metadata())?;
        let stream = self.start_session(token, request.into_inner()).await?;
        Ok(Response::new(stream))
    }

    async fn publish_offset(
        &self,
        request: Request<proto::PublishOffsetRequest>,
    ) -> Result<Response<proto::PublishAck>, Status> {
        let req = request.into_inner();
        let token = parse_token(&req.token)?;
        self.engine
            .publish_offset(&token, Offset::new(req.offset))
            .await
            .map_err(|e| status_from_relay_error(e.into()))?;
        Ok(Response::new(proto::PublishAck {}))
    }

    async fn publish_error(
        &self,
        request: Request<proto::PublishErrorRequest>,
    ) -> Result<Response<proto::PublishAck>, Status> {
        let req = request.into_inner();
        let token = parse_token(&req.token)?;
        require("service_name", &req.service_name, MAX_SERVICE_NAME_LEN)?;
        require("message", &req.message, MAX_ERROR_MESSAGE_LEN)?;

        let mut record = ErrorRecord::new(token, req.service_name, req.message);
        if let Some(ts) = &req.reported_at {
            record.timestamp = timestamp_to_utc(ts)?;
        }
        self.engine
            .publish_error(record)
            .await
            .map_err(|e| status_from_relay_error(e.into()))?;
        Ok(Response::new(proto::PublishAck {}))
    }

    async fn publish_result(
        &self,
        request: Request<proto::PublishResultRequest>,
    ) -> Result<Response<proto::PublishResultResponse>, Status> {
        let feed = self.ingest_feed()?;
        let req = request.into_inner();
        let token = parse_token(&req.token)?;
        let resource = parse_resource(&req.resource_json)?;
        let offset = feed.append(&token, resource);
        Ok(Response::new(proto::PublishResultResponse { offset: offset.value() }))
    }

    async fn end_results(
        &self,
        request: Request<proto::EndResultsRequest>,
    ) -> Result<Response<proto::PublishAck>, Status> {
        let feed = self.ingest_feed()?;
        let token = parse_token(&request.into_inner().token)?;
        feed.end(&token);
        Ok(Response::new(proto::PublishAck {}))
    }
}


pub use proto::relay_client::RelayClient;
