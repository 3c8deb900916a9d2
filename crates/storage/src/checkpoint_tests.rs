// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::{Event, SessionId, SessionSpec};

fn sample_state() -> MaterializedState {
    let mut state = MaterializedState::default();
    state.apply_event(&Event::SessionEnqueued {
        id: SessionId::new("s-1"),
        spec: SessionSpec::builder().build(),
        kernel_ids: vec![berth_core::KernelId::new("k-1")],
        at_ms: 1_000,
    });
    state
}

#[test]
fn background_checkpoint_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.zst");
    let checkpointer = Checkpointer::new(path.clone());

    let handle = checkpointer.start(7, &sample_state());
    let result = handle.wait().unwrap();
    assert_eq!(result.seq, 7);
    assert!(result.size_bytes > 0);

    let loaded = load_snapshot(&path).unwrap().unwrap();
    assert_eq!(loaded.seq, 7);
    assert!(loaded.state.get_session("s-1").is_some());
}

#[test]
fn sync_checkpoint_for_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.zst");
    let checkpointer = Checkpointer::new(path.clone());

    checkpointer.checkpoint_sync(3, &sample_state()).unwrap();
    assert_eq!(load_snapshot(&path).unwrap().unwrap().seq, 3);
}

#[test]
fn load_missing_snapshot_is_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(load_snapshot(&dir.path().join("nope.zst")).unwrap().is_none());
}

#[test]
fn undecodable_checkpoint_is_retired_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.zst");
    std::fs::write(&path, b"this is not zstd").unwrap();

    assert!(load_snapshot(&path).unwrap().is_none());
    assert!(!path.exists());
    assert!(path.with_extension("bak").exists());
}

#[test]
fn newer_checkpoint_version_is_a_hard_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.zst");

    let mut snapshot = crate::Snapshot::new(2, sample_state());
    snapshot.version = crate::CURRENT_SNAPSHOT_VERSION + 1;
    let json = serde_json::to_vec(&snapshot).unwrap();
    let compressed = zstd::encode_all(json.as_slice(), 3).unwrap();
    std::fs::write(&path, compressed).unwrap();

    assert!(matches!(
        load_snapshot(&path).unwrap_err(),
        SnapshotError::TooNew(_, _)
    ));
}

#[test]
fn checkpoint_leaves_no_tmp_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.zst");
    Checkpointer::new(path.clone())
        .checkpoint_sync(1, &sample_state())
        .unwrap();
    assert!(!path.with_extension("tmp").exists());
}
