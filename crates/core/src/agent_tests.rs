// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::slot::Quantity;
use crate::test_support::slots;

#[test]
fn free_slots_subtracts_occupancy() {
    let agent = Agent::builder()
        .total_slots(slots(&[("cpu", 8_000), ("mem", 16)]))
        .occupied_slots(slots(&[("cpu", 3_000)]))
        .build();
    let free = agent.free_slots();
    assert_eq!(free.get("cpu"), Quantity(5_000));
    assert_eq!(free.get("mem"), Quantity(16));
}

#[test]
fn overcommitted_agent_reports_empty_free() {
    // Occupancy exceeding totals is an accounting bug elsewhere; free_slots
    // must not underflow.
    let agent = Agent::builder()
        .total_slots(slots(&[("cpu", 1_000)]))
        .occupied_slots(slots(&[("cpu", 2_000)]))
        .build();
    assert!(agent.free_slots().is_empty());
}

#[yare::parameterized(
    alive = { AgentStatus::Alive, false, true },
    draining = { AgentStatus::Alive, true, false },
    lost = { AgentStatus::Lost, false, false },
    terminated = { AgentStatus::Terminated, false, false },
)]
fn schedulability(status: AgentStatus, draining: bool, expected: bool) {
    let agent = Agent::builder().status(status).draining(draining).build();
    assert_eq!(agent.schedulable(), expected);
}
