//! Upstream feed contract.
//!
//! The relay consumes the filtered-result log as a per-token lazy sequence
//! opened at an offset. How the log is stored or transported is the adapter's
//! business; the session engine only ever sees a [`FeedStream`].

use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::error::{ExecutionError, RelayError};
use crate::record::FilteredResult;
use crate::token::{Offset, Token};

/// Failures surfaced by a feed, in-band.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    /// The partition could not be opened.
    #[error("feed unavailable for token: {message}")]
    Unavailable { message: String },

    /// A single item could not be read.
    #[error("feed read failed at offset {offset}: {message}")]
    Read { offset: Offset, message: String },
}

impl From<FeedError> for ExecutionError {
    fn from(err: FeedError) -> Self {
        Self::Feed {
            message: err.to_string(),
        }
    }
}

impl From<FeedError> for RelayError {
    fn from(err: FeedError) -> Self {
        Self::Execution(err.into())
    }
}

/// Items of one token's partition, in offset order.
///
/// Ends when the upstream signals end-of-partition. Dropping it early must
/// release whatever the adapter holds.
pub type FeedStream = BoxStream<'static, Result<FilteredResult, FeedError>>;

/// A per-token, offset-addressable source of filtered results.
pub trait ResultFeed: Send + Sync {
    /// Open `token`'s partition starting at `from`.
    ///
    /// Never fails directly: if the partition cannot be opened the stream
    /// yields a single `Err` and ends.
    fn open(&self, token: &Token, from: Offset) -> FeedStream;

    /// The offset the next appended item for `token` will get.
    ///
    /// Used when a session starts from the tail instead of a published offset.
    /// The default opens from the start of the partition.
    fn tail(&self, _token: &Token) -> Result<Offset, FeedError> {
        Ok(Offset::ZERO)
    }
}

/// A stream carrying one error and then ending.
#[must_use]
pub fn failed(err: FeedError) -> FeedStream {
    stream::once(async move { Err(err) }).boxed()
}
