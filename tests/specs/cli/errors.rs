//! CLI error behavior without a daemon.

use crate::prelude::*;

#[test]
fn unknown_subcommand_fails_with_usage() {
    let home = SpecHome::new();
    let output = home.berth(&["frobnicate"]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("Usage") || stderr_of(&output).contains("usage"));
}

#[test]
fn commands_without_daemon_report_not_running() {
    let home = SpecHome::new();
    let output = home.berth(&["sessions"]);
    assert!(!output.status.success());
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("not running"));
}

#[test]
fn malformed_slot_pair_is_a_local_error() {
    let home = SpecHome::new();
    let output = home.berth(&[
        "enqueue",
        "--name",
        "x",
        "--access-key",
        "ak",
        "--image",
        "cr.example.com/python:3.12",
        "--slot",
        "cpu2",
    ]);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("NAME=VALUE"));
}
