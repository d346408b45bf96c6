//! Rendezvous controllers.
//!
//! A rendezvous answers `get(token)` for data that may be published before or
//! after the request, without polling and without a long-lived task per token.
//! The controller is generic; it is instantiated for offsets
//! ([`OffsetRendezvous`]) and for error lists ([`ErrorRendezvous`]).

mod controller;
mod errors;
mod offset;

pub use controller::{Absent, RendezvousController, RendezvousError, RendezvousSource, Reply, WaiterTable};
pub use errors::{ErrorListSource, ErrorRendezvous};
pub use offset::{OffsetRendezvous, OffsetSource, StartAt};
