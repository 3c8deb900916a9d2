// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! berth-config: the manager's TOML configuration surface.
//!
//! Everything tunable lives here: queue and placement policy selection,
//! HoL-blocking threshold, tick interval, lease TTL, RPC deadlines, the
//! reconciler's per-state deadline table (with per-resource-group overrides),
//! resource-group slot schemas, and scope resource policies. Loading
//! validates the whole file up front; a daemon never starts on a half-valid
//! config.

mod duration;
mod schema;

pub use duration::parse_duration;
pub use schema::SlotSchema;

use berth_core::{ResourceGroupId, ResourcePolicy, Scope, SessionStatus, SlotName, SlotType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid duration for {field}: {reason}")]
    BadDuration { field: String, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("unknown resource group '{0}'")]
    UnknownGroup(ResourceGroupId),
}

/// Which session-selection policy orders the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPolicyKind {
    #[default]
    Fifo,
    Drf,
    Priority,
}

berth_core::simple_display! {
    SessionPolicyKind {
        Fifo => "fifo",
        Drf => "drf",
        Priority => "priority",
    }
}

/// Which agent-selection policy places kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPolicyKind {
    #[default]
    Concentrated,
    Dispersed,
    Custom,
}

berth_core::simple_display! {
    AgentPolicyKind {
        Concentrated => "concentrated",
        Dispersed => "dispersed",
        Custom => "custom",
    }
}

/// Where the leader lease lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseBackend {
    /// `fs2` lock files on shared storage.
    #[default]
    File,
    /// Process-local, for tests and single-replica deployments.
    Memory,
}

/// `[scheduler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub session_policy: SessionPolicyKind,
    #[serde(default)]
    pub agent_policy: AgentPolicyKind,
    /// Name of the registered hook when `agent_policy = "custom"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_agent_hook: Option<String>,
    /// Unplaceable-attempt count before a pending session may be bypassed.
    #[serde(default = "default_hol_threshold")]
    pub hol_block_threshold: u32,
    /// How many younger fittable candidates may overtake a blocked head.
    #[serde(default = "default_hol_overtake")]
    pub hol_overtake_window: u32,
    #[serde(default = "default_tick_interval", with = "duration::serde_str")]
    pub tick_interval: Duration,
    #[serde(default = "default_lease_ttl", with = "duration::serde_str")]
    pub leader_lock_ttl: Duration,
    /// Cooldown before a transiently failed session is re-enqueued.
    #[serde(default = "default_retry_cooldown", with = "duration::serde_str")]
    pub retry_cooldown: Duration,
    /// A cycle longer than this logs a warning (safety is bounded by the TTL).
    #[serde(default = "default_cycle_warn", with = "duration::serde_str")]
    pub cycle_warn_after: Duration,
}

fn default_hol_threshold() -> u32 {
    3
}
fn default_hol_overtake() -> u32 {
    5
}
fn default_tick_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_lease_ttl() -> Duration {
    Duration::from_secs(10)
}
fn default_retry_cooldown() -> Duration {
    Duration::from_secs(5)
}
fn default_cycle_warn() -> Duration {
    Duration::from_secs(5)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            session_policy: SessionPolicyKind::default(),
            agent_policy: AgentPolicyKind::default(),
            custom_agent_hook: None,
            hol_block_threshold: default_hol_threshold(),
            hol_overtake_window: default_hol_overtake(),
            tick_interval: default_tick_interval(),
            leader_lock_ttl: default_lease_ttl(),
            retry_cooldown: default_retry_cooldown(),
            cycle_warn_after: default_cycle_warn(),
        }
    }
}

/// `[rpc]` section: per-kind southbound deadlines. No RPC waits unboundedly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcConfig {
    #[serde(default = "default_create_timeout", with = "duration::serde_str")]
    pub create_timeout: Duration,
    #[serde(default = "default_destroy_timeout", with = "duration::serde_str")]
    pub destroy_timeout: Duration,
    #[serde(default = "default_exec_timeout", with = "duration::serde_str")]
    pub exec_timeout: Duration,
    #[serde(default = "default_pull_timeout", with = "duration::serde_str")]
    pub image_pull_timeout: Duration,
}

fn default_create_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_destroy_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_exec_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_pull_timeout() -> Duration {
    Duration::from_secs(600)
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            create_timeout: default_create_timeout(),
            destroy_timeout: default_destroy_timeout(),
            exec_timeout: default_exec_timeout(),
            image_pull_timeout: default_pull_timeout(),
        }
    }
}

/// `[agent]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Budget assumed for agents that don't advertise one.
    #[serde(default = "default_concurrency_budget")]
    pub default_concurrency_budget: u32,
}

fn default_concurrency_budget() -> u32 {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_concurrency_budget: default_concurrency_budget(),
        }
    }
}

/// `[reconciler]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    #[serde(default = "default_reconcile_interval", with = "duration::serde_str")]
    pub interval: Duration,
    /// An agent silent for longer than this is declared lost.
    #[serde(default = "default_lost_agent_after", with = "duration::serde_str")]
    pub lost_agent_after: Duration,
    /// Per-state stuck deadlines, keyed by status name ("preparing", …).
    #[serde(default = "default_state_deadlines")]
    pub state_deadlines: IndexMap<String, String>,
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_lost_agent_after() -> Duration {
    Duration::from_secs(30)
}
fn default_state_deadlines() -> IndexMap<String, String> {
    IndexMap::from([
        ("scheduled".to_string(), "1m".to_string()),
        ("preparing".to_string(), "1m".to_string()),
        ("pulling".to_string(), "10m".to_string()),
        ("creating".to_string(), "2m".to_string()),
        ("terminating".to_string(), "1m".to_string()),
    ])
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: default_reconcile_interval(),
            lost_agent_after: default_lost_agent_after(),
            state_deadlines: default_state_deadlines(),
        }
    }
}

/// `[lease]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseConfig {
    #[serde(default)]
    pub backend: LeaseBackend,
    /// Directory for lease files (file backend only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<std::path::PathBuf>,
}

/// `[resource_groups.<name>]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceGroupConfig {
    /// Slot name → slot type. The closed vocabulary for this group: any
    /// request naming a slot outside this table is rejected at enqueue.
    pub slots: IndexMap<SlotName, SlotType>,
    /// Per-group overrides of `[reconciler].state_deadlines`.
    #[serde(default)]
    pub deadlines: IndexMap<String, String>,
}

/// The whole config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub resource_groups: IndexMap<ResourceGroupId, ResourceGroupConfig>,
    /// Scope policies keyed by "kind:name" ("keypair:AKIA…", "domain:default").
    #[serde(default)]
    pub policies: IndexMap<String, ResourcePolicySpec>,
}

/// A resource policy as written in TOML: quantities are human strings,
/// parsed against the merged slot schema during validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourcePolicySpec {
    #[serde(default)]
    pub total_slots: IndexMap<SlotName, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_sessions: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending_sessions: Option<u32>,
    /// Registries this scope may pull images from (empty = no restriction).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_registries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_session_lifetime: Option<String>,
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse and validate from TOML text.
    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.agent_policy == AgentPolicyKind::Custom
            && self.scheduler.custom_agent_hook.is_none()
        {
            return Err(ConfigError::Invalid(
                "scheduler.agent_policy = \"custom\" requires scheduler.custom_agent_hook".into(),
            ));
        }
        if self.scheduler.leader_lock_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.leader_lock_ttl must be positive".into(),
            ));
        }
        if self.scheduler.tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "scheduler.tick_interval must be positive".into(),
            ));
        }
        if self.resource_groups.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one [resource_groups.<name>] is required".into(),
            ));
        }
        for (group, gc) in &self.resource_groups {
            if gc.slots.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "resource group '{group}' declares no slots"
                )));
            }
            Self::check_deadline_keys(&gc.deadlines, &format!("resource_groups.{group}"))?;
        }
        Self::check_deadline_keys(&self.reconciler.state_deadlines, "reconciler")?;
        for key in self.policies.keys() {
            parse_scope_key(key)?;
        }
        // Policy quantities must parse against the merged schema.
        let schema = self.merged_schema()?;
        for (key, spec) in &self.policies {
            for (slot, value) in &spec.total_slots {
                let slot_type = schema.get(slot.as_str()).ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "policy '{key}' caps undeclared slot '{slot}'"
                    ))
                })?;
                slot_type.parse_quantity(value).map_err(|e| {
                    ConfigError::Invalid(format!("policy '{key}', slot '{slot}': {e}"))
                })?;
            }
        }
        Ok(())
    }

    fn check_deadline_keys(
        deadlines: &IndexMap<String, String>,
        context: &str,
    ) -> Result<(), ConfigError> {
        for (state, value) in deadlines {
            status_from_name(state).ok_or_else(|| {
                ConfigError::Invalid(format!("{context}: unknown state '{state}' in deadlines"))
            })?;
            parse_duration(value).map_err(|reason| ConfigError::BadDuration {
                field: format!("{context}.deadlines.{state}"),
                reason,
            })?;
        }
        Ok(())
    }

    /// Slot schema for one resource group.
    pub fn slot_schema(&self, group: &ResourceGroupId) -> Result<SlotSchema, ConfigError> {
        let gc = self
            .resource_groups
            .get(group)
            .ok_or_else(|| ConfigError::UnknownGroup(group.clone()))?;
        Ok(SlotSchema::new(gc.slots.clone()))
    }

    /// Union of all groups' slot tables. Conflicting types are a config error.
    pub fn merged_schema(&self) -> Result<IndexMap<SlotName, SlotType>, ConfigError> {
        let mut merged: IndexMap<SlotName, SlotType> = IndexMap::new();
        for (group, gc) in &self.resource_groups {
            for (name, ty) in &gc.slots {
                match merged.get(name) {
                    Some(existing) if existing != ty => {
                        return Err(ConfigError::Invalid(format!(
                            "slot '{name}' is {existing} in one group but {ty} in '{group}'"
                        )));
                    }
                    _ => {
                        merged.insert(name.clone(), *ty);
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Effective stuck deadline for a state in a group (group override first).
    pub fn state_deadline(
        &self,
        group: &ResourceGroupId,
        status: SessionStatus,
    ) -> Option<Duration> {
        let name = status.to_string();
        let from = |table: &IndexMap<String, String>| {
            table.get(&name).and_then(|v| parse_duration(v).ok())
        };
        self.resource_groups
            .get(group)
            .and_then(|gc| from(&gc.deadlines))
            .or_else(|| from(&self.reconciler.state_deadlines))
    }

    /// Resolved resource policy for a scope (defaults to unbounded).
    pub fn policy_for(&self, scope: &Scope) -> ResourcePolicy {
        let key = scope.to_string();
        let Some(spec) = self.policies.get(&key) else {
            return ResourcePolicy::default();
        };
        let schema = self.merged_schema().unwrap_or_default();
        let total_slots = spec
            .total_slots
            .iter()
            .filter_map(|(slot, value)| {
                let ty = schema.get(slot.as_str())?;
                let q = ty.parse_quantity(value).ok()?;
                Some((slot.clone(), q))
            })
            .collect();
        ResourcePolicy {
            total_slots,
            max_concurrent_sessions: spec.max_concurrent_sessions,
            max_pending_sessions: spec.max_pending_sessions,
            max_pending_slots: None,
            allowed_vfolder_hosts: Vec::new(),
            allowed_registries: spec.allowed_registries.clone(),
            idle_timeout_ms: spec
                .idle_timeout
                .as_deref()
                .and_then(|v| parse_duration(v).ok())
                .map(|d| d.as_millis() as u64),
            max_session_lifetime_ms: spec
                .max_session_lifetime
                .as_deref()
                .and_then(|v| parse_duration(v).ok())
                .map(|d| d.as_millis() as u64),
        }
    }
}

/// Map a status display name back to the enum (for deadline tables).
pub fn status_from_name(name: &str) -> Option<SessionStatus> {
    use SessionStatus::*;
    Some(match name {
        "pending" => Pending,
        "scheduled" => Scheduled,
        "preparing" => Preparing,
        "pulling" => Pulling,
        "prepared" => Prepared,
        "creating" => Creating,
        "running" => Running,
        "restarting" => Restarting,
        "running_degraded" => RunningDegraded,
        "terminating" => Terminating,
        _ => return None,
    })
}

/// Parse a "kind:name" policy key into a [`Scope`].
pub fn parse_scope_key(key: &str) -> Result<Scope, ConfigError> {
    let (kind, name) = key
        .split_once(':')
        .ok_or_else(|| ConfigError::Invalid(format!("policy key '{key}' is not 'kind:name'")))?;
    if name.is_empty() {
        return Err(ConfigError::Invalid(format!("policy key '{key}' has an empty name")));
    }
    match kind {
        "keypair" => Ok(Scope::Keypair(name.to_string())),
        "user" => Ok(Scope::User(name.to_string())),
        "group" => Ok(Scope::Group(name.to_string())),
        "domain" => Ok(Scope::Domain(name.to_string())),
        _ => Err(ConfigError::Invalid(format!(
            "policy key '{key}' has unknown scope kind '{kind}'"
        ))),
    }
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
