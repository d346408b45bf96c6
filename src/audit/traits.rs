//! Audit sink contract.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::ResourceDescriptor;
use crate::token::Token;

/// One delivered resource, as written to the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Token the resource was delivered for.
    pub token: Token,
    /// The delivered resource.
    pub resource: ResourceDescriptor,
    /// Headers of the `RESOURCE` frame that carried it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// When the delivery was submitted.
    pub delivered_at: DateTime<Utc>,
}

impl AuditRecord {
    /// A record stamped with the current time.
    #[must_use]
    pub fn new(token: Token, resource: ResourceDescriptor, headers: BTreeMap<String, String>) -> Self {
        Self {
            token,
            resource,
            headers,
            delivered_at: Utc::now(),
        }
    }
}

/// Why an audit write did not land.
#[derive(Debug, Clone, Error)]
#[allow(missing_docs)]
pub enum AuditError {
    #[error("audit queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("audit sink is shut down")]
    Closed,

    #[error("audit write failed: {message}")]
    Write { message: String },
}

/// Resolves once the sink has durably accepted (or failed) the record.
pub type AuditAck = BoxFuture<'static, Result<(), AuditError>>;

/// At-least-once delivery log.
///
/// `submit` initiates the write before it returns; only the acknowledgment is
/// asynchronous. Callers never block on the sink and failures are theirs to log.
pub trait AuditSink: Send + Sync {
    /// Initiate the write of `record`; the returned future resolves with its outcome.
    fn submit(&self, record: AuditRecord) -> AuditAck;
}
