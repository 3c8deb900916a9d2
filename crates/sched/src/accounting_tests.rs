// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::{Harness, TEST_CONFIG};
use berth_core::test_support::slots;
use berth_core::{AgentId, Quantity};

fn accounting_with_session() -> (Harness, Arc<Accounting>, berth_core::Session, berth_core::Kernel)
{
    let harness = Harness::new(TEST_CONFIG);
    harness.join_agent("agent-1", 8, 16 << 30);
    let id = harness.enqueue("train", "ak-a", "2", "4G");
    let (session, kernel) = harness.ctx.with_state(|s| {
        let session = s.sessions.get(&id).cloned().unwrap();
        let kernel = s.kernels_of(&session)[0].clone();
        (session, kernel)
    });
    let accounting = harness.dispatcher().accounting();
    (harness, accounting, session, kernel)
}

#[test]
fn reserve_writes_agent_and_all_scope_legs() {
    let (harness, accounting, session, kernel) = accounting_with_session();
    let agent_id = AgentId::new("agent-1");

    accounting.reserve_kernel(&session, &kernel, &agent_id, 1).unwrap();

    // One agent leg + four scope legs.
    let ledger_len = harness.ctx.with_state(|s| s.ledger.len());
    assert_eq!(ledger_len, 5);

    assert_eq!(accounting.agent_free(&agent_id).get("cpu"), Quantity(6_000));
    assert_eq!(
        accounting.occupancy(&Scope::Keypair("ak-a".into())).get("cpu"),
        Quantity(2_000)
    );
    assert_eq!(
        accounting.occupancy(&Scope::Domain("default".into())).get("cpu"),
        Quantity(2_000)
    );
}

#[test]
fn release_mirrors_reserve_exactly() {
    let (harness, accounting, session, kernel) = accounting_with_session();
    let agent_id = AgentId::new("agent-1");

    accounting.reserve_kernel(&session, &kernel, &agent_id, 1).unwrap();
    accounting.release_kernel(&session, &kernel, &agent_id, 1).unwrap();

    assert_eq!(accounting.agent_free(&agent_id).get("cpu"), Quantity(8_000));
    assert!(accounting.occupancy(&Scope::Keypair("ak-a".into())).is_empty());
    assert_eq!(harness.ctx.with_state(|s| s.ledger.len()), 10);
}

#[test]
fn stale_token_is_rejected_before_any_write() {
    let (harness, accounting, session, kernel) = accounting_with_session();
    let agent_id = AgentId::new("agent-1");

    accounting.reserve_kernel(&session, &kernel, &agent_id, 5).unwrap();
    let before = harness.ctx.with_state(|s| s.ledger.len());

    // A deposed leader still holding token 3 is fenced out.
    let err = accounting
        .release_kernel(&session, &kernel, &agent_id, 3)
        .unwrap_err();
    assert!(matches!(err, SchedError::StaleLease { held: 3, current: 5 }));
    assert_eq!(harness.ctx.with_state(|s| s.ledger.len()), before);

    // The current (or a newer) token passes.
    accounting.release_kernel(&session, &kernel, &agent_id, 5).unwrap();
}

#[test]
fn scope_remaining_honors_policy_caps() {
    let config = format!(
        r#"{TEST_CONFIG}
[policies."keypair:ak-a".total_slots]
cpu = "4"
"#
    );
    let harness = Harness::new(&config);
    harness.join_agent("agent-1", 8, 16 << 30);
    let id = harness.enqueue("train", "ak-a", "2", "4G");
    let (session, kernel) = harness.ctx.with_state(|s| {
        let session = s.sessions.get(&id).cloned().unwrap();
        let kernel = s.kernels_of(&session)[0].clone();
        (session, kernel)
    });
    let accounting = harness.dispatcher().accounting();
    let agent_id = AgentId::new("agent-1");

    accounting.reserve_kernel(&session, &kernel, &agent_id, 1).unwrap();

    let remaining = accounting.scope_remaining(&Scope::Keypair("ak-a".into()));
    assert_eq!(remaining.get("cpu"), Quantity(2_000));

    // 2 used + 3 requested > 4 cap.
    let err = accounting
        .fits_scopes(&session, &slots(&[("cpu", 3_000)]))
        .unwrap_err();
    assert!(err.contains("keypair:ak-a"));

    // Within the cap it still fits.
    assert!(accounting.fits_scopes(&session, &slots(&[("cpu", 2_000)])).is_ok());
}

#[test]
fn recalculate_is_clean_after_normal_traffic() {
    let (_harness, accounting, session, kernel) = accounting_with_session();
    let agent_id = AgentId::new("agent-1");
    accounting.reserve_kernel(&session, &kernel, &agent_id, 1).unwrap();
    accounting.release_kernel(&session, &kernel, &agent_id, 1).unwrap();
    accounting.reserve_kernel(&session, &kernel, &agent_id, 1).unwrap();

    let report = accounting.recalculate();
    assert!(report.is_clean());
}

#[test]
fn recalculate_detects_and_rewrites_drift() {
    let (harness, accounting, session, kernel) = accounting_with_session();
    let agent_id = AgentId::new("agent-1");
    accounting.reserve_kernel(&session, &kernel, &agent_id, 1).unwrap();

    // Corrupt the stored running total behind the journal's back.
    harness.ctx.with_state_mut(|s| {
        if let Some(agent) = s.agents.get_mut(&agent_id) {
            agent.occupied_slots = slots(&[("cpu", 7_777)]);
        }
    });

    let report = accounting.recalculate();
    assert_eq!(report.drift.len(), 1);
    assert!(report.drift[0].contains("agent-1"));

    // The journal won: totals match a fresh replay again.
    assert!(accounting.recalculate().is_clean());
    assert_eq!(accounting.agent_free(&agent_id).get("cpu"), Quantity(6_000));
}
