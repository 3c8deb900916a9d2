// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::slots;

#[test]
fn seed_marks_first_kernel_main() {
    let ids = vec![KernelId::new("k-1"), KernelId::new("k-2"), KernelId::new("k-3")];
    let kernels = Kernel::seed(
        &ids,
        &SessionId::new("s-1"),
        "cr.example.com/python:3.12",
        "x86_64",
        &slots(&[("cpu", 2_000)]),
    );

    assert_eq!(kernels.len(), 3);
    assert_eq!(kernels[0].role, KernelRole::Main);
    assert_eq!(kernels[0].cluster_idx, 1);
    assert_eq!(kernels[1].role, KernelRole::Sub);
    assert_eq!(kernels[2].cluster_idx, 3);

    // Indexes unique within the session
    let mut idxs: Vec<_> = kernels.iter().map(|k| k.cluster_idx).collect();
    idxs.dedup();
    assert_eq!(idxs.len(), 3);
}

#[test]
fn seeded_kernels_start_unassigned() {
    let kernels = Kernel::seed(
        &[KernelId::new("k-1")],
        &SessionId::new("s-1"),
        "img",
        "aarch64",
        &slots(&[("cpu", 1_000)]),
    );
    let k = &kernels[0];
    assert_eq!(k.status, KernelStatus::Pending);
    assert!(k.agent_id.is_none());
    assert!(k.container_id.is_none());
    assert_eq!(k.attempt_seq, 0);
}

#[yare::parameterized(
    terminated = { KernelStatus::Terminated, true },
    error = { KernelStatus::Error, true },
    running = { KernelStatus::Running, false },
    lost = { KernelStatus::Lost, false },
)]
fn kernel_terminality(status: KernelStatus, terminal: bool) {
    assert_eq!(status.is_terminal(), terminal);
}
