//! End-to-end: enqueue against a live daemon, inspect the queue, cancel.
//!
//! No agents register in these specs, so sessions stay PENDING; the
//! queue-state surface and idempotent cancel are what's under test.

use crate::prelude::*;
use serial_test::serial;

fn enqueue_args<'a>(name: &'a str) -> Vec<&'a str> {
    vec![
        "enqueue",
        "--name",
        name,
        "--access-key",
        "ak-spec",
        "--image",
        "cr.example.com/python:3.12",
        "--slot",
        "cpu=1",
        "--slot",
        "mem=1G",
    ]
}

#[test]
#[serial]
fn enqueue_query_cancel_roundtrip() {
    let home = SpecHome::new();
    let mut daemon = home.spawn_daemon();

    // Enqueue lands in pending.
    let output = home.berth(&enqueue_args("spec-session"));
    assert!(
        output.status.success(),
        "enqueue failed: {}",
        stderr_of(&output)
    );
    let line = stdout_of(&output);
    let id = line.split_whitespace().next().unwrap().to_string();
    assert!(line.contains("pending"));

    // Visible in the queue with zero retries.
    let output = home.berth(&["show-queue", "default"]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("spec-session"));

    // Query by unique prefix.
    let output = home.berth(&["query", &id[..8]]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("status:        pending"));

    // Cancel twice: both succeed, status stays cancelled.
    let output = home.berth(&["cancel", &id]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("cancelled"));
    let output = home.berth(&["cancel", &id]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("cancelled"));

    let _ = home.berth(&["daemon", "stop"]);
    let _ = daemon.wait();
}

#[test]
#[serial]
fn not_found_exits_two_conflict_exits_three() {
    let home = SpecHome::new();
    let mut daemon = home.spawn_daemon();

    let output = home.berth(&["query", "no-such-session"]);
    assert_eq!(output.status.code(), Some(2));

    // Conflict: duplicate live session name.
    assert!(home.berth(&enqueue_args("dup")).status.success());
    let output = home.berth(&enqueue_args("dup"));
    assert_eq!(output.status.code(), Some(3));

    let _ = home.berth(&["daemon", "stop"]);
    let _ = daemon.wait();
}

#[test]
#[serial]
fn status_reports_session_counts() {
    let home = SpecHome::new();
    let mut daemon = home.spawn_daemon();

    assert!(home.berth(&enqueue_args("counted")).status.success());
    let output = home.berth(&["daemon", "status"]);
    assert!(output.status.success());
    assert!(stdout_of(&output).contains("sessions:       1"));

    let _ = home.berth(&["daemon", "stop"]);
    let _ = daemon.wait();
}
