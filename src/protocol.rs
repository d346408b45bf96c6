//! Session wire protocol.
//!
//! Every message is a frame `{type, headers, body}`:
//!
//! | type       | direction       | body                     |
//! |------------|-----------------|--------------------------|
//! | `PING`     | client → server | empty                    |
//! | `CTS`      | client → server | empty                    |
//! | `PONG`     | server → client | empty                    |
//! | `RESOURCE` | server → client | resource descriptor      |
//! | `ERROR`    | server → client | error message (string)   |
//! | `COMPLETE` | server → client | empty                    |
//!
//! Every server frame carries the token header; `ERROR` frames also carry the
//! originating service. Frames are JSON-encoded. The raw frame keeps `type` as
//! a string so that a type this build does not know decodes to
//! [`ClientMessage::Unknown`] instead of failing.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::record::ResourceDescriptor;
use crate::token::Token;

/// Header carrying the token on every frame.
pub const TOKEN_HEADER: &str = "x-relay-token";

/// Header naming the upstream service that reported an `ERROR`.
pub const SERVICE_HEADER: &str = "x-relay-service";

/// Header carrying the 1-based position of a CTS-paired response.
pub const SEQUENCE_HEADER: &str = "x-relay-seq";

/// Service name used for failures raised by the relay itself.
pub const RELAY_SERVICE: &str = "relay";

/// Maximum encoded frame size accepted from a client.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Known frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Client liveness probe.
    Ping,
    /// Answer to `PING`.
    Pong,
    /// Clear to send: the client can take one more response.
    Cts,
    /// One filtered resource.
    Resource,
    /// An upstream or relay failure.
    Error,
    /// End of the response sequence.
    Complete,
}

impl FrameType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Cts => "CTS",
            Self::Resource => "RESOURCE",
            Self::Error => "ERROR",
            Self::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PING" => Ok(Self::Ping),
            "PONG" => Ok(Self::Pong),
            "CTS" => Ok(Self::Cts),
            "RESOURCE" => Ok(Self::Resource),
            "ERROR" => Ok(Self::Error),
            "COMPLETE" => Ok(Self::Complete),
            other => Err(other.to_string()),
        }
    }
}

/// A raw frame as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame type as sent; unknown names are kept verbatim.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// Frame headers, including the token.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub body: serde_json::Value,
}

impl Frame {
    /// A frame of `frame_type` with only the token header.
    #[must_use]
    pub fn new(frame_type: FrameType, token: &Token) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(TOKEN_HEADER.to_string(), token.to_string());
        Self {
            frame_type: frame_type.as_str().to_string(),
            headers,
            body: serde_json::Value::Null,
        }
    }

    /// Parsed type, if known.
    #[must_use]
    pub fn known_type(&self) -> Option<FrameType> {
        self.frame_type.parse().ok()
    }

    /// The token header, if present and valid.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        self.headers.get(TOKEN_HEADER).and_then(|t| Token::new(t.as_str()).ok())
    }

    /// Value of header `name`.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Encodes the frame as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::SerializationFailed {
            message: e.to_string(),
        })
    }

    /// Decodes a frame, rejecting oversized input before parsing.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(TransportError::DeserializationFailed {
                message: format!("frame of {} bytes exceeds maximum {MAX_FRAME_BYTES}", bytes.len()),
            });
        }
        serde_json::from_slice(bytes).map_err(|e| TransportError::DeserializationFailed {
            message: e.to_string(),
        })
    }
}

/// What a client can ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Liveness probe; answered with `PONG` straight away.
    Ping,
    /// Request for the next response.
    Cts,
    /// Anything else, including server-only types echoed back. Ignored.
    Unknown(String),
}

impl ClientMessage {
    /// Interprets a frame received from a client.
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Self {
        match frame.known_type() {
            Some(FrameType::Ping) => Self::Ping,
            Some(FrameType::Cts) => Self::Cts,
            _ => Self::Unknown(frame.frame_type.clone()),
        }
    }

    /// Decodes raw bytes; undecodable input becomes `Unknown`.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        match Frame::from_json(bytes) {
            Ok(frame) => Self::from_frame(&frame),
            Err(e) => {
                tracing::debug!(error = %e, "discarding undecodable client frame");
                Self::Unknown(String::new())
            }
        }
    }

    /// Builds the wire frame for this message (used by clients).
    #[must_use]
    pub fn to_frame(&self, token: &Token) -> Frame {
        match self {
            Self::Ping => Frame::new(FrameType::Ping, token),
            Self::Cts => Frame::new(FrameType::Cts, token),
            Self::Unknown(kind) => {
                let mut frame = Frame::new(FrameType::Ping, token);
                frame.frame_type.clone_from(kind);
                frame
            }
        }
    }
}

/// What the server sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Answer to a `PING`.
    Pong,
    /// A filtered resource.
    Resource(ResourceDescriptor),
    /// An error reported by `service`.
    Error { service: String, message: String },
    /// No more responses follow.
    Complete,
}

impl ServerMessage {
    /// The frame type this message is sent as.
    #[must_use]
    pub const fn frame_type(&self) -> FrameType {
        match self {
            Self::Pong => FrameType::Pong,
            Self::Resource(_) => FrameType::Resource,
            Self::Error { .. } => FrameType::Error,
            Self::Complete => FrameType::Complete,
        }
    }

    /// Builds the wire frame for `token`.
    pub fn to_frame(&self, token: &Token) -> Result<Frame, TransportError> {
        let mut frame = Frame::new(self.frame_type(), token);
        match self {
            Self::Pong | Self::Complete => {}
            Self::Resource(resource) => {
                frame.body = serde_json::to_value(resource).map_err(|e| TransportError::SerializationFailed {
                    message: e.to_string(),
                })?;
            }
            Self::Error { service, message } => {
                frame.headers.insert(SERVICE_HEADER.to_string(), service.clone());
                frame.body = serde_json::Value::String(message.clone());
            }
        }
        Ok(frame)
    }

    /// Interprets a frame received from the server (used by clients).
    pub fn from_frame(frame: &Frame) -> Result<Self, TransportError> {
        let malformed = |message: String| TransportError::DeserializationFailed { message };
        match frame.known_type() {
            Some(FrameType::Pong) => Ok(Self::Pong),
            Some(FrameType::Complete) => Ok(Self::Complete),
            Some(FrameType::Resource) => serde_json::from_value(frame.body.clone())
                .map(Self::Resource)
                .map_err(|e| malformed(format!("bad RESOURCE body: {e}"))),
            Some(FrameType::Error) => Ok(Self::Error {
                service: frame.header(SERVICE_HEADER).unwrap_or(RELAY_SERVICE).to_string(),
                message: frame.body.as_str().unwrap_or_default().to_string(),
            }),
            _ => Err(malformed(format!("not a server frame type: {}", frame.frame_type))),
        }
    }
}
