// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::{SessionId, SessionStatus};

#[yare::parameterized(
    validation = { SchedError::Validation("x".into()), ErrorKind::Validation },
    not_found = { SchedError::NotFound("x".into()), ErrorKind::Validation },
    conflict = { SchedError::Conflict("x".into()), ErrorKind::Validation },
    capacity = { SchedError::Capacity("x".into()), ErrorKind::Capacity },
    transient = { SchedError::Transient("x".into()), ErrorKind::Transient },
    permanent = { SchedError::Permanent("x".into()), ErrorKind::Permanent },
    invariant = { SchedError::Invariant("x".into()), ErrorKind::InvariantViolation },
    stale_lease = { SchedError::StaleLease { held: 1, current: 2 }, ErrorKind::Transient },
    storage = { SchedError::Storage("x".into()), ErrorKind::Transient },
)]
fn kinds(error: SchedError, kind: ErrorKind) {
    assert_eq!(error.kind(), kind);
}

#[test]
fn lost_cas_race_is_transient() {
    let error = SchedError::Transition(TransitionError::Stale {
        id: SessionId::new("s"),
        expected: SessionStatus::Pending,
        actual: SessionStatus::Scheduled,
    });
    assert_eq!(error.kind(), ErrorKind::Transient);
}

#[test]
fn illegal_edge_is_an_invariant_violation() {
    let error = SchedError::Transition(TransitionError::IllegalEdge {
        id: SessionId::new("s"),
        from: SessionStatus::Pending,
        to: SessionStatus::Running,
    });
    assert_eq!(error.kind(), ErrorKind::InvariantViolation);
}

#[test]
fn rpc_errors_split_by_retriability() {
    assert_eq!(
        SchedError::from_rpc(RpcError::Timeout { kind: "create_kernel" }).kind(),
        ErrorKind::Transient
    );
    assert_eq!(
        SchedError::from_rpc(RpcError::Rejected("no such image".into())).kind(),
        ErrorKind::Permanent
    );
}
