//! Client sessions.
//!
//! A session moves through `AwaitingOffset → Streaming → Draining → Complete`.
//! See [`SessionEngine::run`] for the pairing rules.

mod engine;
mod pending;
mod sequence;
mod state;

pub use engine::SessionEngine;
pub use pending::{ErrorReceipt, PendingErrors};
pub use sequence::{response_sequence, Response, Sequence, Sources};
pub use state::{Phase, SessionState, SessionSummary};
