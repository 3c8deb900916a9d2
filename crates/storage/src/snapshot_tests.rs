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
fn save_and_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    let snapshot = Snapshot::new(42, sample_state());
    snapshot.save(&path).unwrap();

    let loaded = Snapshot::load(&path).unwrap().unwrap();
    assert_eq!(loaded.seq, 42);
    assert_eq!(loaded.version, CURRENT_SNAPSHOT_VERSION);
    assert!(loaded.state.get_session("s-1").is_some());
}

#[test]
fn load_missing_returns_none() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Snapshot::load(&dir.path().join("nope.json")).unwrap().is_none());
}

#[test]
fn corrupt_snapshot_rotates_to_bak() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    std::fs::write(&path, b"{ not json").unwrap();

    let loaded = Snapshot::load(&path).unwrap();
    assert!(loaded.is_none());
    assert!(!path.exists());
    assert!(path.with_extension("bak").exists());
}

#[test]
fn bak_rotation_keeps_three() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    for n in 0..5 {
        std::fs::write(&path, format!("corrupt {n}")).unwrap();
        assert!(Snapshot::load(&path).unwrap().is_none());
    }

    assert!(path.with_extension("bak").exists());
    assert!(path.with_extension("bak.2").exists());
    assert!(path.with_extension("bak.3").exists());
    assert!(!path.with_extension("bak.4").exists());
}

#[test]
fn newer_version_is_a_hard_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    let mut snapshot = Snapshot::new(1, sample_state());
    snapshot.version = CURRENT_SNAPSHOT_VERSION + 1;
    snapshot.save(&path).unwrap();

    let err = Snapshot::load(&path).unwrap_err();
    assert!(matches!(err, SnapshotError::TooNew(v, _) if v == CURRENT_SNAPSHOT_VERSION + 1));
    // The file is left in place for the newer build that wrote it.
    assert!(path.exists());
}

#[test]
fn missing_version_field_reads_as_v1() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    // Hand-written snapshot without the "v" tag.
    let mut value = serde_json::to_value(Snapshot::new(3, sample_state())).unwrap();
    value.as_object_mut().unwrap().remove("v");
    std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

    let loaded = Snapshot::load(&path).unwrap().unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.seq, 3);
}

#[test]
fn save_is_atomic_via_tmp() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    Snapshot::new(1, sample_state()).save(&path).unwrap();
    Snapshot::new(2, sample_state()).save(&path).unwrap();

    assert!(!path.with_extension("tmp").exists());
    assert_eq!(Snapshot::load(&path).unwrap().unwrap().seq, 2);
}
