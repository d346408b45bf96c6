//! Restart recovery for the durable token store.
//!
//! These tests verify that:
//! - offsets and undelivered error records survive a restart
//! - errors delivered before a restart are not delivered again
//! - a torn or corrupted log is cut at the last valid entry

#![cfg(feature = "persistent")]

mod support;

use std::fs;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;

use tokenrelay::{
    open_store, ClientMessage, ErrorRecord, FrameType, Offset, RelayConfig, ResourceDescriptor, TokenStore, TtlConfig,
};

use support::{label, relay_over, token, Client};

const WAL_FILE: &str = "relay.wal";

fn store_at(dir: &std::path::Path) -> Arc<dyn TokenStore> {
    Arc::new(open_store(dir, TtlConfig::default(), None).unwrap())
}

/// Reopen once the previous process's last rendezvous worker has let go of the lock.
async fn reopen(dir: &std::path::Path) -> Arc<dyn TokenStore> {
    for _ in 0..100 {
        if let Ok(store) = open_store(dir, TtlConfig::default(), None) {
            return Arc::new(store);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("store at {} stayed locked", dir.display());
}

#[tokio::test]
async fn session_after_restart_sees_state_published_before_it() {
    let dir = tempdir().unwrap();
    let t = token("restart");

    {
        let r = relay_over(store_at(dir.path()), RelayConfig::default());
        r.engine.publish_offset(&t, Offset::new(1)).await.unwrap();
        r.engine
            .publish_error(ErrorRecord::new(t.clone(), "lookup", "directory timeout"))
            .await
            .unwrap();
    }

    let r = relay_over(reopen(dir.path()).await, RelayConfig::default());
    r.feed.append(&t, ResourceDescriptor::new("before-offset"));
    r.feed.append(&t, ResourceDescriptor::new("r1"));
    r.feed.end(&t);

    let mut client = Client::connect(&r.engine, &t);
    let mut got = Vec::new();
    for _ in 0..3 {
        client.send(ClientMessage::Cts).await;
        got.push(label(&client.recv().await));
    }
    assert_eq!(got, ["E:lookup", "R:r1", "COMPLETE"]);
    client.close().await;
}

#[tokio::test]
async fn delivered_errors_stay_delivered_after_restart() {
    let dir = tempdir().unwrap();
    let t = token("once");

    {
        let r = relay_over(store_at(dir.path()), RelayConfig::default());
        r.engine.publish_offset(&t, Offset::ZERO).await.unwrap();
        r.engine
            .publish_error(ErrorRecord::new(t.clone(), "policy", "rule missing"))
            .await
            .unwrap();
        r.feed.end(&t);

        let mut client = Client::connect(&r.engine, &t);
        client.send(ClientMessage::Cts).await;
        assert_eq!(label(&client.recv().await), "E:policy");
        client.send(ClientMessage::Cts).await;
        assert_eq!(client.recv().await.known_type(), Some(FrameType::Complete));
        client.close().await;
    }

    let r = relay_over(reopen(dir.path()).await, RelayConfig::default());
    r.feed.end(&t);
    let mut client = Client::connect(&r.engine, &t);
    client.send(ClientMessage::Cts).await;
    assert_eq!(client.recv().await.known_type(), Some(FrameType::Complete));
    client.close().await;
}

/// A crash mid-append leaves a torn record at the end of the log.
#[tokio::test]
async fn torn_tail_is_dropped_on_reopen() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE);

    {
        let store = store_at(dir.path());
        for i in 0..5 {
            store.put_offset(&token(&format!("t{i}")), Offset::new(i)).await.unwrap();
        }
    }

    {
        let file = fs::OpenOptions::new().write(true).open(&wal_path).unwrap();
        let size = file.metadata().unwrap().len();
        file.set_len(size * 4 / 5).unwrap();
    }

    let store = store_at(dir.path());
    let mut recovered = 0;
    for i in 0..5 {
        if store.get_offset(&token(&format!("t{i}"))).await.unwrap().is_some() {
            recovered += 1;
        }
    }
    assert!((1..=4).contains(&recovered), "recovered {recovered} of 5");
    assert!(store.get_offset(&token("t0")).await.unwrap().is_some());

    // Appends after recovery follow the valid prefix.
    store.put_offset(&token("after"), Offset::new(9)).await.unwrap();
    drop(store);
    let store = store_at(dir.path());
    assert_eq!(store.get_offset(&token("after")).await.unwrap(), Some(Offset::new(9)));
}

#[tokio::test]
async fn corrupted_record_cuts_replay_there() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join(WAL_FILE);

    {
        let store = store_at(dir.path());
        for i in 0..6 {
            store.put_offset(&token(&format!("c{i}")), Offset::new(i)).await.unwrap();
        }
    }

    {
        let mut content = Vec::new();
        fs::File::open(&wal_path).unwrap().read_to_end(&mut content).unwrap();
        // Past the 5-byte header, inside a later record.
        let idx = content.len() * 3 / 4;
        content[idx] ^= 0xFF;
        fs::File::create(&wal_path).unwrap().write_all(&content).unwrap();
    }

    let store = store_at(dir.path());
    assert_eq!(store.get_offset(&token("c0")).await.unwrap(), Some(Offset::new(0)));
    assert_eq!(store.get_offset(&token("c5")).await.unwrap(), None);
}

#[tokio::test]
async fn second_open_of_a_live_directory_fails() {
    let dir = tempdir().unwrap();
    let _first = store_at(dir.path());
    assert!(open_store(dir.path(), TtlConfig::default(), None).is_err());
}
