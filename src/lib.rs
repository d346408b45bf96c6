//! # TokenRelay - Token-Scoped Streaming Delivery
//!
//! TokenRelay delivers the filtered results of a governed resource request to
//! the client that asked for them. Everything about one request is correlated
//! by an opaque **token**; the upstream pipeline publishes a starting offset,
//! error reports, and filtered results for that token, any of which may arrive
//! before or after the client connects.
//!
//! ## Core Concepts
//!
//! - **Rendezvous**: `get(token)` answers as soon as the value exists, whether
//!   it was published before or after the request (bounded wait, no polling)
//! - **Session**: a strict pull protocol; the Nth `CTS` is answered by the Nth
//!   response of `early errors ++ feed items ++ late errors ++ COMPLETE`
//! - **Audit**: every `RESOURCE` delivery is handed to the audit sink before
//!   the frame leaves
//! - **TokenStore**: TTL-backed persistence that lets a reconnecting client
//!   pick up where the last session left off
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokenrelay::{InMemoryFeed, InMemoryTokenStore, MemoryAuditSink, RelayConfig, SessionEngine};
//!
//! let feed = InMemoryFeed::new();
//! let engine = SessionEngine::new(
//!     Arc::new(InMemoryTokenStore::default()),
//!     Arc::new(feed.clone()),
//!     Arc::new(MemoryAuditSink::new()),
//!     RelayConfig::default(),
//! )?;
//!
//! let token = tokenrelay::Token::new("req-42")?;
//! engine.publish_offset(&token, tokenrelay::Offset::ZERO).await?;
//! let summary = engine.run(token, client_messages, outgoing_frames).await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod config;
pub mod error;
pub mod record;
pub mod token;

// Collaborators
pub mod audit;
pub mod feed;
pub mod storage;

// Coordination and protocol
pub mod protocol;
pub mod rendezvous;
pub mod session;

#[cfg(feature = "transport-grpc")]
pub mod transport;

// Re-export primary types at crate root for convenience
pub use audit::{AuditRecord, AuditSink, FileAuditSink, MemoryAuditSink};
pub use config::{AbsentOffsetPolicy, AuditConfig, RelayConfig, RendezvousConfig, SessionConfig, TtlConfig};
pub use error::{ExecutionError, RelayError, RelayResult, TransportError, ValidationError};
pub use feed::{FeedError, InMemoryFeed, ResultFeed};
pub use protocol::{ClientMessage, Frame, FrameType, ServerMessage};
pub use record::{CommitHandle, CommitOutcome, ErrorRecord, FilteredResult, ResourceDescriptor};
pub use rendezvous::{ErrorRendezvous, OffsetRendezvous, RendezvousError, StartAt};
pub use session::{SessionEngine, SessionSummary};
pub use storage::{EntityKind, InMemoryTokenStore, StorageError, TokenStore};
pub use token::{Offset, Token};

#[cfg(feature = "persistent")]
pub use storage::persistent::{open_store, PersistentConfig, PersistentTokenStore};
