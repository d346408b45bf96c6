//! Delivery audit.
//!
//! Every `RESOURCE` frame is preceded by an [`AuditSink::submit`] call.
//! `ERROR` and `COMPLETE` frames are not deliveries and are never audited.

mod file;
mod memory;
mod traits;

pub use file::FileAuditSink;
pub use memory::MemoryAuditSink;
pub use traits::{AuditAck, AuditError, AuditRecord, AuditSink};
