//! Token-keyed storage for offsets, error records and completeness markers.
//!
//! [`TokenStore`] is the abstract interface; [`InMemoryTokenStore`] backs tests
//! and embedded use, and the `persistent` feature adds a WAL-backed store.

mod clock;
mod memory;
mod sweeper;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::{Expiring, InMemoryTokenStore, StateSnapshot};
pub use sweeper::spawn_sweeper;
pub use traits::{EntityKind, LeaseId, StorageError, TokenStore};

pub(crate) use clock::add_ttl;
