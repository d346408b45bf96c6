//! The logical response sequence of a session.
//!
//! ```text
//! early errors ++ feed items ++ late errors ++ COMPLETE
//! ```
//!
//! or, if the offset cannot be resolved, `ERROR, COMPLETE`. The sequence is
//! lazy: nothing is resolved or drained until the first element is pulled, and
//! the late-error drain runs only once the feed has ended. Dropping it cancels
//! the outstanding rendezvous wait and closes the feed. Drained error records
//! are held in the session's [`PendingErrors`] until they are sent.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};

use crate::feed::{failed, FeedError, ResultFeed};
use crate::protocol::RELAY_SERVICE;
use crate::record::{ErrorRecord, FilteredResult};
use crate::rendezvous::{ErrorRendezvous, OffsetRendezvous, RendezvousError, StartAt};
use crate::token::Token;

use super::pending::{ErrorReceipt, PendingErrors};
use super::state::Phase;

/// One CTS-paired response, before framing.
#[derive(Debug)]
pub enum Response {
    /// A feed item to audit and deliver.
    Resource(FilteredResult),
    /// An error to send as `ERROR`.
    Error {
        /// Reporting service.
        service: String,
        /// Failure message.
        message: String,
        /// Set for stored error records; relay-originated errors have none.
        receipt: Option<ErrorReceipt>,
    },
    /// The closing `COMPLETE`.
    Complete,
}

impl Response {
    fn relay_error(message: impl Into<String>) -> Self {
        Self::Error {
            service: RELAY_SERVICE.to_string(),
            message: message.into(),
            receipt: None,
        }
    }

    fn held(record: ErrorRecord, receipt: ErrorReceipt) -> Self {
        Self::Error {
            service: record.service_name,
            message: record.message,
            receipt: Some(receipt),
        }
    }
}

/// A response tagged with the phase it belongs to.
pub type Sequence = BoxStream<'static, (Phase, Response)>;

/// Collaborators the sequence pulls from.
#[derive(Clone)]
pub struct Sources {
    /// Offset rendezvous.
    pub offsets: OffsetRendezvous,
    /// Error-list rendezvous.
    pub errors: ErrorRendezvous,
    /// Upstream results.
    pub feed: Arc<dyn ResultFeed>,
}

/// Build the response sequence for `token`, holding drained errors in `pending`.
pub fn response_sequence(sources: Sources, token: Token, pending: PendingErrors) -> Sequence {
    stream::once(async move {
        match sources.offsets.resolve(token.clone()).await {
            Ok(start) => streaming(sources, token, start, pending).await,
            Err(e) => {
                tracing::warn!(token = %token, error = %e, "offset resolution failed");
                collapsed(&e)
            }
        }
    })
    .flatten()
    .boxed()
}

fn collapsed(err: &RendezvousError) -> Sequence {
    stream::iter([
        (Phase::AwaitingOffset, Response::relay_error(format!("offset resolution failed: {err}"))),
        (Phase::Complete, Response::Complete),
    ])
    .boxed()
}

async fn streaming(sources: Sources, token: Token, start: StartAt, pending: PendingErrors) -> Sequence {
    let early = drain(&sources.errors, &token, &pending, Phase::Streaming).await;

    let feed = match start {
        StartAt::Offset(offset) => sources.feed.open(&token, offset),
        StartAt::Tail => match sources.feed.tail(&token) {
            Ok(offset) => sources.feed.open(&token, offset),
            Err(e) => failed(e),
        },
    };
    let feed_token = token.clone();
    let items = feed.map(move |item| (Phase::Streaming, feed_response(&feed_token, item)));

    let errors = sources.errors.clone();
    let late = stream::once(async move { drain(&errors, &token, &pending, Phase::Draining).await }).flatten();

    early
        .chain(items)
        .chain(late)
        .chain(stream::once(async { (Phase::Complete, Response::Complete) }))
        .boxed()
}

fn feed_response(token: &Token, item: Result<FilteredResult, FeedError>) -> Response {
    match item {
        Ok(result) => Response::Resource(result),
        Err(e) => {
            tracing::warn!(token = %token, error = %e, "feed error");
            Response::relay_error(e.to_string())
        }
    }
}

/// Drain the error list; a failed drain becomes a single `ERROR`.
async fn drain(
    errors: &ErrorRendezvous,
    token: &Token,
    pending: &PendingErrors,
    phase: Phase,
) -> BoxStream<'static, (Phase, Response)> {
    let responses: Vec<_> = match errors.resolve(token.clone()).await {
        Ok(records) => pending
            .hold(records)
            .into_iter()
            .map(|(record, receipt)| (phase, Response::held(record, receipt)))
            .collect(),
        Err(e) => {
            tracing::warn!(token = %token, error = %e, "error drain failed");
            vec![(phase, Response::relay_error(format!("error drain failed: {e}")))]
        }
    };
    stream::iter(responses).boxed()
}
