// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::test_support::slots;
use berth_core::{ClusterMode, Kernel, KernelId, SessionId, SessionSpec};

fn snapshot(agents: &[(&str, u64)]) -> PlacementSnapshot {
    PlacementSnapshot {
        agents: agents
            .iter()
            .map(|(id, cpu)| AgentFreeView {
                id: AgentId::new(*id),
                architecture: "x86_64".into(),
                free: slots(&[("cpu", *cpu)]),
            })
            .collect(),
    }
}

fn need(cpu: u64) -> berth_core::ResourceSlots {
    slots(&[("cpu", cpu)])
}

#[test]
fn concentrated_picks_least_free() {
    let snap = snapshot(&[("agent-a", 8_000), ("agent-b", 2_000), ("agent-c", 4_000)]);
    let picked = Concentrated.select(&need(1_000), "x86_64", &snap);
    assert_eq!(picked, Some(AgentId::new("agent-b")));
}

#[test]
fn dispersed_picks_most_free() {
    let snap = snapshot(&[("agent-a", 8_000), ("agent-b", 2_000), ("agent-c", 4_000)]);
    let picked = Dispersed.select(&need(1_000), "x86_64", &snap);
    assert_eq!(picked, Some(AgentId::new("agent-a")));
}

#[test]
fn ties_break_by_agent_id_deterministically() {
    let snap = snapshot(&[("agent-b", 4_000), ("agent-a", 4_000)]);
    assert_eq!(
        Concentrated.select(&need(1_000), "x86_64", &snap),
        Some(AgentId::new("agent-a"))
    );
    assert_eq!(
        Dispersed.select(&need(1_000), "x86_64", &snap),
        Some(AgentId::new("agent-a"))
    );
}

#[test]
fn architecture_mismatch_is_ineligible() {
    let mut snap = snapshot(&[("agent-a", 8_000)]);
    snap.agents[0].architecture = "aarch64".into();
    assert_eq!(Concentrated.select(&need(1_000), "x86_64", &snap), None);
}

#[test]
fn nothing_fits_returns_none() {
    let snap = snapshot(&[("agent-a", 2_000)]);
    assert_eq!(Concentrated.select(&need(4_000), "x86_64", &snap), None);
}

#[test]
fn custom_hook_first_fitting_choice_wins() {
    let hook: CustomHook = Arc::new(|_need, _arch, _snap| {
        vec![AgentId::new("agent-tiny"), AgentId::new("agent-big")]
    });
    let selector = CustomSelector::new("rack-aware", hook);
    let snap = snapshot(&[("agent-tiny", 1_000), ("agent-big", 8_000)]);

    // The hook's first choice doesn't fit a 2-cpu request; re-validation
    // falls through to its second choice.
    assert_eq!(
        selector.select(&need(2_000), "x86_64", &snap),
        Some(AgentId::new("agent-big"))
    );
}

#[test]
fn hook_registry_round_trip() {
    let mut registry = HookRegistry::new();
    let hook: CustomHook = Arc::new(|_, _, snap| snap.agents().iter().map(|a| a.id.clone()).collect());
    registry.register("first-listed", hook);
    assert!(registry.get("first-listed").is_some());
    assert!(registry.get("missing").is_none());
}

fn session(cluster_size: u32, mode: ClusterMode, cpu_per_kernel: u64) -> (berth_core::Session, Vec<Kernel>) {
    let spec = SessionSpec::builder()
        .cluster_size(cluster_size)
        .cluster_mode(mode)
        .requested_slots(slots(&[("cpu", cpu_per_kernel)]))
        .build();
    let kernel_ids: Vec<KernelId> =
        (0..cluster_size).map(|i| KernelId::new(format!("k-{i}"))).collect();
    let session = berth_core::Session::new(SessionId::new("s-1"), spec, kernel_ids.clone(), 0);
    let kernels = Kernel::seed(
        &kernel_ids,
        &session.id,
        &session.spec.image,
        "x86_64",
        &session.spec.requested_slots,
    );
    (session, kernels)
}

#[test]
fn single_node_places_all_kernels_jointly() {
    let (session, kernels) = session(2, ClusterMode::SingleNode, 2_000);
    let refs: Vec<&Kernel> = kernels.iter().collect();
    // agent-a can hold one kernel but not two; agent-b holds both.
    let snap = snapshot(&[("agent-a", 3_000), ("agent-b", 4_000)]);

    let plan = plan_session(&session, &refs, &snap, &Concentrated).unwrap();
    assert_eq!(plan.len(), 2);
    assert!(plan.iter().all(|(_, agent)| agent == &AgentId::new("agent-b")));
}

#[test]
fn multi_node_rounds_update_free_slots() {
    let (session, kernels) = session(2, ClusterMode::MultiNode, 2_000);
    let refs: Vec<&Kernel> = kernels.iter().collect();
    // Each agent fits exactly one kernel: the second round must see the
    // first round's reservation and go to the other agent.
    let snap = snapshot(&[("agent-a", 2_000), ("agent-b", 2_000)]);

    let plan = plan_session(&session, &refs, &snap, &Concentrated).unwrap();
    let agents: Vec<&AgentId> = plan.iter().map(|(_, a)| a).collect();
    assert_ne!(agents[0], agents[1]);
}

#[test]
fn failed_round_fails_whole_attempt_and_releases_nothing() {
    let (session, kernels) = session(2, ClusterMode::MultiNode, 2_000);
    let refs: Vec<&Kernel> = kernels.iter().collect();
    let snap = snapshot(&[("agent-a", 2_000)]);

    let err = plan_session(&session, &refs, &snap, &Concentrated).unwrap_err();
    assert!(err.contains("round 2"));
    // The shared snapshot is untouched; only the attempt's clone changed.
    assert_eq!(snap.free_of(&AgentId::new("agent-a")), Some(&need(2_000)));
}

#[test]
fn selector_from_config_validates_custom_hook() {
    let config = berth_config::Config::from_toml(
        r#"
[scheduler]
agent_policy = "custom"
custom_agent_hook = "rack-aware"

[resource_groups.default.slots]
cpu = "count"
"#,
    )
    .unwrap();

    let empty = HookRegistry::new();
    assert!(selector_from_config(&config, &empty).is_err());

    let mut registry = HookRegistry::new();
    registry.register(
        "rack-aware",
        Arc::new(
            |_: &ResourceSlots, _: &str, _: &PlacementSnapshot| Vec::new(),
        ) as CustomHook,
    );
    assert!(selector_from_config(&config, &registry).is_ok());
}
