// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::session::SessionStatus;

#[test]
fn events_serialize_with_type_tag() {
    let event = Event::SessionStatusChanged {
        id: SessionId::new("s-1"),
        status: SessionStatus::Running,
        reason: None,
        result: None,
        at_ms: 7,
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "session:status");
    assert_eq!(json["status"], "running");
}

#[test]
fn unknown_type_tag_deserializes_to_custom() {
    let event: Event =
        serde_json::from_str(r#"{"type":"session:frobnicate","id":"x"}"#).unwrap();
    assert_eq!(event, Event::Custom);
}

#[test]
fn event_roundtrip() {
    let event = Event::LedgerDelta {
        account: LedgerAccount::Agent(AgentId::new("agent-1")),
        session_id: SessionId::new("s-1"),
        kernel_id: KernelId::new("k-1"),
        slots: crate::test_support::slots(&[("cpu", 2_000)]),
        direction: AccountingDirection::Reserve,
        token: 3,
    };
    let json = serde_json::to_string(&event).unwrap();
    let back: Event = serde_json::from_str(&json).unwrap();
    assert_eq!(back, event);
}

#[yare::parameterized(
    session = { Event::SessionTouched { id: SessionId::new("s"), at_ms: 0 }, "session.status" },
    kernel = { Event::KernelDispatchStarted { kernel_id: KernelId::new("k"), attempt_seq: 1 }, "kernel.status" },
    agent = { Event::AgentDrainSet { agent_id: AgentId::new("a"), draining: true }, "agent.status" },
    sched = { Event::SchedulerCycleNoted { group: ResourceGroupId::new("default"), at_ms: 0 }, "scheduler.tick" },
)]
fn topics(event: Event, topic: &str) {
    assert_eq!(event.topic(), topic);
}

#[test]
fn log_summary_is_short_and_stable() {
    let event = Event::KernelAssigned {
        kernel_id: KernelId::new("0123456789abcdef"),
        agent_id: AgentId::new("agent-1"),
    };
    assert_eq!(event.log_summary(), "kernel:assigned 01234567 -> agent-1");
}

#[test]
fn ledger_account_display() {
    let a = LedgerAccount::Agent(AgentId::new("agent-1"));
    assert_eq!(a.to_string(), "agent:agent-1");
    let s = LedgerAccount::Scope(crate::scope::Scope::Keypair("AKIA".into()));
    assert_eq!(s.to_string(), "keypair:AKIA");
}
