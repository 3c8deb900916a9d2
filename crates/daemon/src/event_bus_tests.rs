// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::{Event, SessionId};
use berth_storage::Wal;
use std::time::Duration;

fn touched(n: u64) -> Event {
    Event::SessionTouched {
        id: SessionId::new(format!("s-{n}")),
        at_ms: n,
    }
}

fn open_bus(dir: &tempfile::TempDir) -> (EventBus, EngineFeed) {
    let wal = Wal::open(&dir.path().join("events.wal"), 0).unwrap();
    EventBus::new(wal)
}

#[tokio::test]
async fn send_assigns_seq_and_feed_drains_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, feed) = open_bus(&dir);

    assert_eq!(bus.send(touched(1)).unwrap(), 1);
    assert_eq!(bus.send(touched(2)).unwrap(), 2);

    let first = feed.next().await.unwrap();
    assert_eq!(first.seq, 1);
    assert_eq!(first.event, touched(1));
    feed.mark_processed(first.seq);

    let second = feed.next().await.unwrap();
    assert_eq!(second.seq, 2);
    feed.mark_processed(second.seq);
    assert_eq!(bus.processed_seq(), 2);
    assert_eq!(bus.write_seq(), 2);
}

#[tokio::test]
async fn feed_wakes_on_later_send() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, feed) = open_bus(&dir);

    let waiter = tokio::spawn(async move {
        let entry = feed.next().await.unwrap();
        entry.seq
    });

    // Give the feed time to park before the write arrives.
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.send(touched(1)).unwrap();

    let seq = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seq, 1);
}

#[tokio::test]
async fn send_before_wait_leaves_a_permit() {
    // The wake must not be lost when the send lands while nobody waits.
    let dir = tempfile::tempdir().unwrap();
    let (bus, feed) = open_bus(&dir);

    bus.send(touched(1)).unwrap();
    let entry = tokio::time::timeout(Duration::from_secs(5), feed.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.seq, 1);
}

#[tokio::test]
async fn compact_through_drops_checkpointed_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, feed) = open_bus(&dir);

    for n in 1..=4 {
        bus.send(touched(n)).unwrap();
    }
    feed.mark_processed(4);
    bus.flush().unwrap();

    // A checkpoint at seq 3 makes entries 1..=3 redundant.
    feed.compact_through(3).unwrap();

    let wal = Wal::open(&dir.path().join("events.wal"), 0).unwrap();
    let seqs: Vec<u64> = wal.entries_after(0).unwrap().iter().map(|e| e.seq).collect();
    assert_eq!(seqs, [4]);
}

#[test]
fn wal_sink_applies_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, _feed) = open_bus(&dir);
    let state = Arc::new(Mutex::new(MaterializedState::default()));
    let sink = WalSink::new(bus.clone(), Arc::clone(&state));

    let seq = sink
        .emit(Event::SessionEnqueued {
            id: SessionId::new("s-1"),
            spec: berth_core::SessionSpec::builder().build(),
            kernel_ids: vec![berth_core::KernelId::new("k-1")],
            at_ms: 1_000,
        })
        .unwrap();
    assert_eq!(seq, 1);

    // Applied immediately: the writer sees its own write.
    assert!(state.lock().get_session("s-1").is_some());

    // And durable after a flush.
    bus.flush().unwrap();
    let wal = Wal::open(&dir.path().join("events.wal"), 0).unwrap();
    assert_eq!(wal.entries_after(0).unwrap().len(), 1);
}
