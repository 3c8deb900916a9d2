// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use SessionStatus::*;

#[yare::parameterized(
    pending_scheduled = { Pending, Scheduled },
    pending_cancelled = { Pending, Cancelled },
    scheduled_preparing = { Scheduled, Preparing },
    preparing_pulling = { Preparing, Pulling },
    preparing_creating = { Preparing, Creating },
    pulling_prepared = { Pulling, Prepared },
    prepared_creating = { Prepared, Creating },
    creating_running = { Creating, Running },
    running_restarting = { Running, Restarting },
    restarting_running = { Restarting, Running },
    running_degraded = { Running, RunningDegraded },
    degraded_recovered = { RunningDegraded, Running },
    running_terminating = { Running, Terminating },
    terminating_terminated = { Terminating, Terminated },
    creating_error = { Creating, Error },
    preparing_error = { Preparing, Error },
    pending_forced_destroy = { Pending, Terminating },
)]
fn declared_edges_are_legal(from: SessionStatus, to: SessionStatus) {
    assert!(from.can_transition_to(to), "{from} -> {to} should be legal");
}

#[yare::parameterized(
    pending_running = { Pending, Running },
    scheduled_running = { Scheduled, Running },
    running_pending = { Running, Pending },
    terminated_running = { Terminated, Running },
    cancelled_scheduled = { Cancelled, Scheduled },
    error_terminating = { Error, Terminating },
    terminated_error = { Terminated, Error },
    creating_pulling = { Creating, Pulling },
    prepared_running = { Prepared, Running },
)]
fn undeclared_edges_are_rejected(from: SessionStatus, to: SessionStatus) {
    assert!(!from.can_transition_to(to), "{from} -> {to} should be illegal");
}

#[test]
fn every_non_terminal_state_can_error_and_terminate() {
    let all = [
        Pending, Scheduled, Preparing, Pulling, Prepared, Creating, Running, Restarting,
        RunningDegraded, Terminating,
    ];
    for s in all {
        assert!(s.can_transition_to(Error), "{s} -> error");
        if s != Terminating {
            assert!(s.can_transition_to(Terminating), "{s} -> terminating");
        }
    }
}

#[test]
fn terminal_states_have_no_exits() {
    let all = [
        Pending, Scheduled, Preparing, Pulling, Prepared, Creating, Running, Restarting,
        RunningDegraded, Terminating, Terminated, Cancelled, Error,
    ];
    for terminal in [Terminated, Cancelled, Error] {
        for next in all {
            assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
        }
    }
}

#[test]
fn holds_resources_excludes_pending_and_terminal() {
    assert!(!Pending.holds_resources());
    assert!(Scheduled.holds_resources());
    assert!(Running.holds_resources());
    assert!(!Terminated.holds_resources());
    assert!(!Error.holds_resources());
}

#[test]
fn status_serializes_snake_case() {
    let json = serde_json::to_string(&RunningDegraded).unwrap();
    assert_eq!(json, "\"running_degraded\"");
}

#[test]
fn session_total_requested_scales_with_cluster_size() {
    let spec = SessionSpec::builder().cluster_size(3).build();
    let session = Session::new(SessionId::new("s-1"), spec, vec![], 0);
    assert_eq!(
        session.total_requested().get("cpu"),
        crate::slot::Quantity(3_000)
    );
}

#[test]
fn batch_kind_exposes_dependencies_and_starts_at() {
    let kind = SessionKind::Batch {
        dependencies: vec![SessionId::new("dep-1")],
        starts_at_ms: Some(42),
    };
    assert_eq!(kind.session_type(), SessionType::Batch);
    assert_eq!(kind.dependencies(), &[SessionId::new("dep-1")]);
    assert_eq!(kind.starts_at_ms(), Some(42));
    assert!(SessionKind::System.dependencies().is_empty());
}

#[test]
fn idle_timeout_prefers_spec_over_policy() {
    let spec = SessionSpec::builder()
        .kind(SessionKind::Interactive { idle_timeout_ms: Some(5_000) })
        .build();
    let session = Session::new(SessionId::new("s-1"), spec, vec![], 0);
    assert_eq!(session.idle_timeout_ms(Some(60_000)), Some(5_000));

    let spec = SessionSpec::builder().build();
    let session = Session::new(SessionId::new("s-2"), spec, vec![], 0);
    assert_eq!(session.idle_timeout_ms(Some(60_000)), Some(60_000));

    // Batch sessions have no idle timeout.
    let spec = SessionSpec::builder()
        .kind(SessionKind::Batch { dependencies: vec![], starts_at_ms: None })
        .build();
    let session = Session::new(SessionId::new("s-3"), spec, vec![], 0);
    assert_eq!(session.idle_timeout_ms(Some(60_000)), None);
}

#[test]
fn spec_serde_roundtrip() {
    let spec = SessionSpec::builder()
        .name("train-7")
        .priority(5)
        .kind(SessionKind::Batch {
            dependencies: vec![SessionId::new("dep-1")],
            starts_at_ms: None,
        })
        .build();
    let json = serde_json::to_string(&spec).unwrap();
    let back: SessionSpec = serde_json::from_str(&json).unwrap();
    assert_eq!(back, spec);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn arb_status() -> impl Strategy<Value = SessionStatus> {
        proptest::sample::select(vec![
            Pending, Scheduled, Preparing, Pulling, Prepared, Creating, Running, Restarting,
            RunningDegraded, Terminating, Terminated, Cancelled, Error,
        ])
    }

    proptest! {
        /// No edge ever leaves a terminal state, and every legal edge out of
        /// a non-terminal state lands on a declared target.
        #[test]
        fn edges_respect_terminality(from in arb_status(), to in arb_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
            if from.can_transition_to(to) {
                prop_assert!(!from.is_terminal());
            }
        }
    }
}
