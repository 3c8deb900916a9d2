// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

fn with_state_dir(dir: &tempfile::TempDir) -> Paths {
    std::env::set_var("BERTH_STATE_DIR", dir.path());
    std::env::remove_var("BERTH_CONFIG");
    Paths::load().unwrap()
}

#[test]
#[serial]
fn paths_prefer_env_override() {
    let dir = tempfile::tempdir().unwrap();
    let paths = with_state_dir(&dir);
    assert_eq!(paths.state_dir, dir.path());
    assert_eq!(paths.socket_path, dir.path().join("berthd.sock"));
    assert_eq!(paths.wal_path, dir.path().join("wal").join("events.wal"));
    assert_eq!(paths.config_path, dir.path().join("berth.toml"));
    std::env::remove_var("BERTH_STATE_DIR");
}

#[test]
#[serial]
fn explicit_config_path_wins() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("BERTH_STATE_DIR", dir.path());
    std::env::set_var("BERTH_CONFIG", dir.path().join("custom.toml"));
    let paths = Paths::load().unwrap();
    assert_eq!(paths.config_path, dir.path().join("custom.toml"));
    std::env::remove_var("BERTH_CONFIG");
    std::env::remove_var("BERTH_STATE_DIR");
}

#[tokio::test]
#[serial]
async fn startup_and_shutdown_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let paths = with_state_dir(&dir);

    let result = startup(&paths).await.unwrap();
    assert!(paths.socket_path.exists());
    assert!(paths.lock_path.exists());

    // Write something through ops so the snapshot has content.
    let receipt = result
        .daemon
        .ops
        .enqueue_session(berth_sched::test_support::request(
            "persisted",
            "ak-a",
            "2",
            "4G",
            1,
            berth_core::ClusterMode::SingleNode,
            berth_core::SessionKind::Interactive { idle_timeout_ms: None },
        ))
        .unwrap();
    assert!(receipt.seq > 0);

    result.daemon.shutdown();
    assert!(!paths.socket_path.exists());
    assert!(!paths.lock_path.exists());
    assert!(paths.snapshot_path.exists());

    std::env::remove_var("BERTH_STATE_DIR");
}

#[tokio::test]
#[serial]
async fn second_instance_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let paths = with_state_dir(&dir);

    let first = startup(&paths).await.unwrap();
    let second = startup(&paths).await;
    assert!(matches!(second, Err(LifecycleError::LockFailed(_))));

    first.daemon.shutdown();
    std::env::remove_var("BERTH_STATE_DIR");
}

#[tokio::test]
#[serial]
async fn recovery_replays_wal_after_snapshotless_restart() {
    let dir = tempfile::tempdir().unwrap();
    let paths = with_state_dir(&dir);

    let session_id = {
        let result = startup(&paths).await.unwrap();
        let receipt = result
            .daemon
            .ops
            .enqueue_session(berth_sched::test_support::request(
                "survivor",
                "ak-a",
                "2",
                "4G",
                1,
                berth_core::ClusterMode::SingleNode,
                berth_core::SessionKind::Interactive { idle_timeout_ms: None },
            ))
            .unwrap();
        // Flush but do NOT snapshot: simulate a crash.
        result.daemon.event_bus.flush().unwrap();
        result.daemon.cancel.cancel();
        drop(result);
        receipt.session_id
    };
    // The lock file still exists (crash), but its holder is gone, so the
    // flock is free again.
    let result = startup(&paths).await.unwrap();
    let recovered = result
        .daemon
        .state
        .lock()
        .get_session(session_id.as_str())
        .is_some();
    assert!(recovered, "session must be rebuilt from the WAL");

    result.daemon.shutdown();
    std::env::remove_var("BERTH_STATE_DIR");
}

#[test]
#[serial]
fn missing_config_falls_back_to_default_group() {
    let config = default_config().unwrap();
    assert!(config.resource_groups.contains_key("default"));
}
