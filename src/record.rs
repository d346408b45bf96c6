//! Records exchanged between the upstream pipeline and the relay.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::token::{Offset, Token};

/// An error reported by an upstream service while processing a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Token the failure belongs to.
    pub token: Token,
    /// Upstream service that reported it.
    pub service_name: String,
    /// Human-readable failure.
    pub message: String,
    /// When it was reported.
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(token: Token, service_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            token,
            service_name: service_name.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Description of a resource the client is allowed to see.
///
/// Attribute masking has already been applied upstream; the relay treats the
/// attributes as opaque JSON. `path` lists ancestor resource ids from the root
/// down, so hierarchy is carried by id and never by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Stable identifier of the resource.
    pub resource_id: String,
    /// Ancestor ids, root first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    /// Masked attributes.
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl ResourceDescriptor {
    /// Creates a descriptor with no ancestry and no attributes.
    #[must_use]
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            path: Vec::new(),
            attributes: serde_json::Value::Null,
        }
    }

    /// Sets the attribute payload.
    #[must_use]
    pub fn with_attributes(mut self, attributes: serde_json::Value) -> Self {
        self.attributes = attributes;
        self
    }

    /// Sets the ancestor path.
    #[must_use]
    pub fn with_path(mut self, path: Vec<String>) -> Self {
        self.path = path;
        self
    }
}

/// What happened to a feed item handed to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Item was delivered to the client; the feed may advance past it.
    Committed,
    /// Item was not delivered; the feed must redeliver it on the next open.
    Dropped,
}

type AckFn = Box<dyn FnOnce(CommitOutcome) + Send>;

/// Acknowledgment hook for one feed item.
///
/// Exactly one outcome is reported per handle. A handle dropped without an
/// explicit call reports [`CommitOutcome::Dropped`].
pub struct CommitHandle {
    offset: Offset,
    ack: Option<AckFn>,
}

impl CommitHandle {
    /// Creates a handle that reports its outcome through `ack`.
    pub fn new(offset: Offset, ack: impl FnOnce(CommitOutcome) + Send + 'static) -> Self {
        Self {
            offset,
            ack: Some(Box::new(ack)),
        }
    }

    /// Creates a handle for feeds that do not checkpoint.
    #[must_use]
    pub fn detached(offset: Offset) -> Self {
        Self { offset, ack: None }
    }

    /// Offset of the item this handle acknowledges.
    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.offset
    }

    /// Acknowledges delivery.
    pub fn commit(mut self) {
        if let Some(ack) = self.ack.take() {
            ack(CommitOutcome::Committed);
        }
    }

    /// Explicitly gives the item back to the feed.
    pub fn release(mut self) {
        if let Some(ack) = self.ack.take() {
            ack(CommitOutcome::Dropped);
        }
    }
}

impl Drop for CommitHandle {
    fn drop(&mut self) {
        if let Some(ack) = self.ack.take() {
            tracing::debug!(offset = %self.offset, "commit handle dropped without outcome");
            ack(CommitOutcome::Dropped);
        }
    }
}

impl fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHandle")
            .field("offset", &self.offset)
            .field("pending", &self.ack.is_some())
            .finish()
    }
}

/// One item pulled from the upstream feed.
#[derive(Debug)]
pub struct FilteredResult {
    /// Token whose partition the item came from.
    pub token: Token,
    /// The resource to deliver.
    pub resource: ResourceDescriptor,
    /// Acknowledges the item back to the feed.
    pub commit: CommitHandle,
}

impl FilteredResult {
    /// Offset of this item in the token's partition.
    #[must_use]
    pub const fn offset(&self) -> Offset {
        self.commit.offset()
    }
}
