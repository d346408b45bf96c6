mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use tokenrelay::config::RendezvousConfig;
use tokenrelay::protocol::SEQUENCE_HEADER;
use tokenrelay::rendezvous::WaiterTable;
use tokenrelay::{
    ClientMessage, FrameType, InMemoryTokenStore, Offset, OffsetRendezvous, RelayConfig, RendezvousError,
    ResourceDescriptor, StartAt, TokenStore,
};

use support::{label, relay, relay_over, token, Client, FailingStore};

fn offsets(store: Arc<dyn TokenStore>, max_wait: Duration) -> OffsetRendezvous {
    OffsetRendezvous::for_offsets(
        store,
        RendezvousConfig {
            offset_max_wait: max_wait,
            ..RendezvousConfig::default()
        },
        Arc::new(WaiterTable::new()),
    )
}

#[tokio::test]
async fn concurrent_gets_before_and_after_set_agree() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::default());
    let rv = offsets(store, Duration::from_secs(5));
    let t = token("race");

    let early: Vec<_> = (0..16).map(|_| rv.get(t.clone())).collect();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let setter = {
        let rv = rv.clone();
        let t = t.clone();
        tokio::spawn(async move { rv.set(&t, Offset::new(42)).await })
    };
    let late: Vec<_> = (0..16).map(|_| rv.get(t.clone())).collect();
    setter.await.unwrap().unwrap();

    for reply in join_all(early).await.into_iter().chain(join_all(late).await) {
        assert_eq!(reply.unwrap().unwrap(), StartAt::Offset(Offset::new(42)));
    }
    assert_eq!(rv.waiters().waiting(&t), 0);
}

#[tokio::test]
async fn set_for_one_token_leaves_others_waiting() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::default());
    let rv = offsets(store, Duration::from_millis(300));
    let a = token("a");
    let b = token("b");

    let waiting_b = rv.get(b.clone());
    rv.set(&a, Offset::new(1)).await.unwrap();

    let err = waiting_b.await.unwrap().unwrap_err();
    assert!(matches!(err, RendezvousError::Timeout { .. }));
    assert_eq!(rv.resolve(a).await.unwrap(), StartAt::Offset(Offset::new(1)));
}

#[tokio::test(start_paused = true)]
async fn absent_offset_times_out_after_configured_wait() {
    let store: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::default());
    let rv = offsets(store, Duration::from_secs(30));

    let started = tokio::time::Instant::now();
    let err = rv.resolve(token("never")).await.unwrap_err();
    assert!(matches!(err, RendezvousError::Timeout { .. }));
    assert!(started.elapsed() >= Duration::from_secs(30));
}

#[tokio::test]
async fn store_failure_is_reported_not_waited_out() {
    let store = Arc::new(FailingStore::default());
    let t = token("broken");
    store.fail_offsets_for(&t);
    let rv = offsets(store, Duration::from_secs(30));

    let err = tokio::time::timeout(Duration::from_secs(1), rv.resolve(t))
        .await
        .expect("storage errors answer immediately")
        .unwrap_err();
    assert!(matches!(err, RendezvousError::Storage(_)));
}

/// Client pulls first; the offset is published 200ms later.
#[tokio::test]
async fn cts_before_offset_is_answered_once_published() {
    let r = relay();
    let t = token("scenario-a");
    r.feed.append(&t, ResourceDescriptor::new("r1"));

    let mut client = Client::connect(&r.engine, &t);
    client.send(ClientMessage::Cts).await;
    assert!(client.quiet_for(Duration::from_millis(200)).await);

    r.engine.publish_offset(&t, Offset::ZERO).await.unwrap();
    let frame = client.recv().await;
    assert_eq!(label(&frame), "R:r1");
    assert_eq!(frame.header(SEQUENCE_HEADER), Some("1"));
    assert_eq!(r.audit.len(), 1);

    client.close().await;
}

#[tokio::test]
async fn republished_offset_is_harmless() {
    let r = relay();
    let t = token("replayed");
    r.engine.publish_offset(&t, Offset::new(1)).await.unwrap();
    r.engine.publish_offset(&t, Offset::new(1)).await.unwrap();
    r.feed.append(&t, ResourceDescriptor::new("skipped"));
    r.feed.append(&t, ResourceDescriptor::new("kept"));
    r.feed.end(&t);

    let mut client = Client::connect(&r.engine, &t);
    client.send(ClientMessage::Cts).await;
    client.send(ClientMessage::Cts).await;
    assert_eq!(label(&client.recv().await), "R:kept");
    assert_eq!(client.recv().await.known_type(), Some(FrameType::Complete));
    client.close().await;
}

#[tokio::test]
async fn start_from_tail_skips_backlog() {
    let mut config = RelayConfig::default();
    config.rendezvous.absent_offset = tokenrelay::AbsentOffsetPolicy::StartFromTail;
    let r = relay_over(Arc::new(InMemoryTokenStore::default()), config);
    let t = token("tail");
    r.feed.append(&t, ResourceDescriptor::new("old"));

    let mut client = Client::connect(&r.engine, &t);
    client.send(ClientMessage::Cts).await;
    // Let the session resolve to the tail before anything new arrives.
    assert!(client.quiet_for(Duration::from_millis(100)).await);

    r.feed.append(&t, ResourceDescriptor::new("new"));
    assert_eq!(label(&client.recv().await), "R:new");
    client.close().await;
}
