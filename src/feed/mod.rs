//! Upstream filtered-result feed.

mod memory;
mod traits;

pub use memory::InMemoryFeed;
pub use traits::{failed, FeedError, FeedStream, ResultFeed};
