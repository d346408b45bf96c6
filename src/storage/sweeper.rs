//! Background TTL eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::traits::TokenStore;

/// Spawn a task that calls [`TokenStore::evict_expired`] every `interval`.
///
/// Failures are logged and the sweep is retried on the next tick. Abort the
/// returned handle to stop sweeping.
pub fn spawn_sweeper(store: Arc<dyn TokenStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.evict_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(evicted) => tracing::debug!(evicted, "evicted expired entries"),
                Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::TtlConfig;
    use crate::storage::{Clock, InMemoryTokenStore, ManualClock};
    use crate::token::{Offset, Token};

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_each_tick() {
        // The store's clock lags wall time, so entries it writes are already
        // stale from the sweeper's point of view.
        let clock = Arc::new(ManualClock::new(Utc::now() - chrono::Duration::hours(2)));
        let store = Arc::new(InMemoryTokenStore::with_clock(
            TtlConfig {
                offset_ttl: Duration::from_secs(60),
                ..TtlConfig::default()
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        ));
        let t = Token::new("t").unwrap();
        store.put_offset(&t, Offset::new(3)).await.unwrap();
        assert_eq!(store.get_offset(&t).await.unwrap(), Some(Offset::new(3)));

        let handle = spawn_sweeper(Arc::clone(&store) as Arc<dyn TokenStore>, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(11)).await;
        handle.abort();

        assert_eq!(store.get_offset(&t).await.unwrap(), None);
    }
}
