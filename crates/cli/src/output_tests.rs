// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::{Kernel, KernelId, Session, SessionId, SessionSpec};

fn query() -> SessionQuery {
    let spec = SessionSpec::builder().name("train-7").build();
    let kernel_ids = vec![KernelId::new("kernel-0123456789")];
    let kernels = Kernel::seed(
        &kernel_ids,
        &SessionId::new("sess-0123456789abcdef"),
        &spec.image,
        &spec.architecture,
        &spec.requested_slots,
    );
    SessionQuery {
        session: Session::new(SessionId::new("sess-0123456789abcdef"), spec, kernel_ids, 0),
        kernels,
        history: vec![berth_core::StatusEntry {
            seq: 1,
            status: berth_core::SessionStatus::Pending,
            reason: None,
            at_ms: 0,
        }],
    }
}

#[test]
fn row_truncates_ids() {
    let row = session_row(&query());
    assert!(row.contains("sess-0123456"));
    assert!(!row.contains("sess-0123456789abcdef"));
    assert!(row.contains("train-7"));
    assert!(row.contains("pending"));
}

#[test]
fn detail_includes_kernels_and_history() {
    let detail = session_detail(&query());
    assert!(detail.contains("name:          train-7"));
    assert!(detail.contains("kernels:"));
    assert!(detail.contains("main"));
    assert!(detail.contains("history:"));
    assert!(detail.contains("#1 pending"));
}

#[test]
fn header_and_rows_align() {
    assert!(session_header().starts_with("ID"));
}
