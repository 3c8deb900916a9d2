// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use std::io::Write;

const MINIMAL: &str = r#"
[resource_groups.default.slots]
cpu = "count"
mem = "bytes"
"#;

#[test]
fn minimal_config_gets_defaults() {
    let config = Config::from_toml(MINIMAL).unwrap();
    assert_eq!(config.scheduler.session_policy, SessionPolicyKind::Fifo);
    assert_eq!(config.scheduler.agent_policy, AgentPolicyKind::Concentrated);
    assert_eq!(config.scheduler.hol_block_threshold, 3);
    assert_eq!(config.scheduler.tick_interval, Duration::from_secs(2));
    assert_eq!(config.scheduler.leader_lock_ttl, Duration::from_secs(10));
    assert_eq!(config.rpc.create_timeout, Duration::from_secs(60));
    assert_eq!(config.agent.default_concurrency_budget, 4);
}

#[test]
fn full_scheduler_section_parses() {
    let text = format!(
        r#"
[scheduler]
session_policy = "drf"
agent_policy = "dispersed"
hol_block_threshold = 2
tick_interval = "500ms"
leader_lock_ttl = "30s"
{MINIMAL}"#
    );
    let config = Config::from_toml(&text).unwrap();
    assert_eq!(config.scheduler.session_policy, SessionPolicyKind::Drf);
    assert_eq!(config.scheduler.agent_policy, AgentPolicyKind::Dispersed);
    assert_eq!(config.scheduler.hol_block_threshold, 2);
    assert_eq!(config.scheduler.tick_interval, Duration::from_millis(500));
    assert_eq!(config.scheduler.leader_lock_ttl, Duration::from_secs(30));
}

#[test]
fn custom_policy_requires_hook_name() {
    let text = format!(
        r#"
[scheduler]
agent_policy = "custom"
{MINIMAL}"#
    );
    assert!(matches!(Config::from_toml(&text), Err(ConfigError::Invalid(_))));

    let text = format!(
        r#"
[scheduler]
agent_policy = "custom"
custom_agent_hook = "rack-aware"
{MINIMAL}"#
    );
    let config = Config::from_toml(&text).unwrap();
    assert_eq!(config.scheduler.custom_agent_hook.as_deref(), Some("rack-aware"));
}

#[test]
fn missing_resource_groups_is_invalid() {
    assert!(matches!(
        Config::from_toml("[scheduler]\n"),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn group_without_slots_is_invalid() {
    let text = r#"
[resource_groups.default]
"#;
    assert!(Config::from_toml(text).is_err());
}

#[test]
fn unknown_deadline_state_is_invalid() {
    let text = r#"
[reconciler.state_deadlines]
flying = "1m"

[resource_groups.default.slots]
cpu = "count"
"#;
    assert!(matches!(Config::from_toml(text), Err(ConfigError::Invalid(_))));
}

#[test]
fn state_deadline_prefers_group_override() {
    let text = r#"
[reconciler.state_deadlines]
creating = "2m"
pulling = "10m"

[resource_groups.default.slots]
cpu = "count"

[resource_groups.gpu.slots]
cpu = "count"

[resource_groups.gpu.deadlines]
creating = "5m"
"#;
    let config = Config::from_toml(text).unwrap();
    let default = ResourceGroupId::new("default");
    let gpu = ResourceGroupId::new("gpu");

    assert_eq!(
        config.state_deadline(&default, SessionStatus::Creating),
        Some(Duration::from_secs(120))
    );
    assert_eq!(
        config.state_deadline(&gpu, SessionStatus::Creating),
        Some(Duration::from_secs(300))
    );
    // No override for pulling: falls back to the global table.
    assert_eq!(
        config.state_deadline(&gpu, SessionStatus::Pulling),
        Some(Duration::from_secs(600))
    );
}

#[test]
fn policies_parse_against_merged_schema() {
    let text = r#"
[resource_groups.default.slots]
cpu = "count"
mem = "bytes"

[policies."keypair:AKIA"]
max_concurrent_sessions = 3
idle_timeout = "10m"
[policies."keypair:AKIA".total_slots]
cpu = "10"
mem = "32G"
"#;
    let config = Config::from_toml(text).unwrap();
    let policy = config.policy_for(&Scope::Keypair("AKIA".into()));
    assert_eq!(policy.total_slots.get("cpu"), berth_core::Quantity(10_000));
    assert_eq!(policy.total_slots.get("mem"), berth_core::Quantity(32 << 30));
    assert_eq!(policy.max_concurrent_sessions, Some(3));
    assert_eq!(policy.idle_timeout_ms, Some(600_000));

    // Unknown scope gets the unbounded default.
    let policy = config.policy_for(&Scope::Keypair("other".into()));
    assert!(policy.total_slots.is_empty());
    assert_eq!(policy.max_concurrent_sessions, None);
}

#[test]
fn policy_capping_undeclared_slot_is_invalid() {
    let text = r#"
[resource_groups.default.slots]
cpu = "count"

[policies."keypair:AKIA".total_slots]
fpga = "1"
"#;
    assert!(matches!(Config::from_toml(text), Err(ConfigError::Invalid(_))));
}

#[test]
fn bad_policy_key_is_invalid() {
    let text = r#"
[resource_groups.default.slots]
cpu = "count"

[policies."nonsense"]
max_concurrent_sessions = 1
"#;
    assert!(Config::from_toml(text).is_err());
}

#[test]
fn conflicting_slot_types_across_groups_is_invalid() {
    let text = r#"
[resource_groups.a.slots]
cpu = "count"

[resource_groups.b.slots]
cpu = "bytes"
"#;
    assert!(matches!(Config::from_toml(text), Err(ConfigError::Invalid(_))));
}

#[test]
fn load_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("berth.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(MINIMAL.as_bytes()).unwrap();

    let config = Config::load(&path).unwrap();
    assert!(config.resource_groups.contains_key("default"));

    let missing = Config::load(&dir.path().join("nope.toml"));
    assert!(matches!(missing, Err(ConfigError::Read { .. })));
}

#[yare::parameterized(
    keypair = { "keypair:AKIA", "keypair" },
    user = { "user:alice", "user" },
    group = { "group:ml", "group" },
    domain = { "domain:default", "domain" },
)]
fn scope_keys_parse(key: &str, kind: &str) {
    assert_eq!(parse_scope_key(key).unwrap().kind(), kind);
}

#[test]
fn slot_schema_for_unknown_group_errors() {
    let config = Config::from_toml(MINIMAL).unwrap();
    assert!(matches!(
        config.slot_schema(&ResourceGroupId::new("nope")),
        Err(ConfigError::UnknownGroup(_))
    ));
}
