// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent-selection (placement) policies.
//!
//! Selection is pure over a [`PlacementSnapshot`]; multi-node sessions pick
//! their agents in rounds against the snapshot's in-memory free slots, so a
//! failed round costs nothing: the caller simply drops the snapshot clone
//! and the tentative reservations with it.

use berth_config::{AgentPolicyKind, Config};
use berth_core::{AgentId, Kernel, KernelId, ResourceSlots, Session};
use berth_storage::MaterializedState;
use std::collections::HashMap;
use std::sync::Arc;

/// One agent as placement sees it.
#[derive(Debug, Clone)]
pub struct AgentFreeView {
    pub id: AgentId,
    pub architecture: String,
    pub free: ResourceSlots,
}

/// Immutable-by-convention view of a group's schedulable agents.
///
/// The scheduler clones one per placement attempt and mutates only the
/// clone; custom hooks get a shared reference and cannot touch live state.
#[derive(Debug, Clone, Default)]
pub struct PlacementSnapshot {
    agents: Vec<AgentFreeView>,
}

impl PlacementSnapshot {
    pub fn from_state(state: &MaterializedState, group: &berth_core::ResourceGroupId) -> Self {
        let agents = state
            .agents_in_group(group)
            .into_iter()
            .filter(|a| a.schedulable())
            .map(|a| AgentFreeView {
                id: a.id.clone(),
                architecture: a.architecture.clone(),
                free: a.free_slots(),
            })
            .collect();
        Self { agents }
    }

    pub fn agents(&self) -> &[AgentFreeView] {
        &self.agents
    }

    pub fn free_of(&self, id: &AgentId) -> Option<&ResourceSlots> {
        self.agents.iter().find(|a| &a.id == id).map(|a| &a.free)
    }

    pub fn free_all(&self) -> Vec<ResourceSlots> {
        self.agents.iter().map(|a| a.free.clone()).collect()
    }

    /// Take slots from an agent (a tentative in-memory reservation).
    pub fn reserve(&mut self, id: &AgentId, slots: &ResourceSlots) -> bool {
        let Some(agent) = self.agents.iter_mut().find(|a| &a.id == id) else {
            return false;
        };
        match agent.free.subtracted(slots) {
            Ok(rest) => {
                agent.free = rest;
                true
            }
            Err(_) => false,
        }
    }

    /// Agents that match the architecture and currently fit `need`.
    fn eligible(&self, need: &ResourceSlots, architecture: &str) -> Vec<&AgentFreeView> {
        self.agents
            .iter()
            .filter(|a| a.architecture == architecture && need.fits_within(&a.free))
            .collect()
    }
}

/// Scalar used to order agents by "how free" they are for a request:
/// the sum of free quantities over the requested slot names.
fn free_weight(agent: &AgentFreeView, need: &ResourceSlots) -> u128 {
    need.names()
        .map(|name| agent.free.get(name.as_str()).0 as u128)
        .sum()
}

/// An agent-selection policy.
pub trait AgentSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pick one agent for a kernel needing `need`, or `None` if nothing fits.
    fn select(
        &self,
        need: &ResourceSlots,
        architecture: &str,
        snapshot: &PlacementSnapshot,
    ) -> Option<AgentId>;
}

/// Bin-packing: prefer the agent with the least free capacity that still
/// fits; ties break by agent id for determinism.
#[derive(Debug, Default, Clone)]
pub struct Concentrated;

impl AgentSelector for Concentrated {
    fn name(&self) -> &'static str {
        "concentrated"
    }

    fn select(
        &self,
        need: &ResourceSlots,
        architecture: &str,
        snapshot: &PlacementSnapshot,
    ) -> Option<AgentId> {
        snapshot
            .eligible(need, architecture)
            .into_iter()
            .min_by_key(|a| (free_weight(a, need), a.id.clone()))
            .map(|a| a.id.clone())
    }
}

/// Spreading: prefer the agent with the most free capacity.
#[derive(Debug, Default, Clone)]
pub struct Dispersed;

impl AgentSelector for Dispersed {
    fn name(&self) -> &'static str {
        "dispersed"
    }

    fn select(
        &self,
        need: &ResourceSlots,
        architecture: &str,
        snapshot: &PlacementSnapshot,
    ) -> Option<AgentId> {
        snapshot
            .eligible(need, architecture)
            .into_iter()
            .max_by_key(|a| (free_weight(a, need), std::cmp::Reverse(a.id.clone())))
            .map(|a| a.id.clone())
    }
}

/// Signature of a registered custom placement hook.
///
/// Hooks are pure over the snapshot: they return a ranked candidate list and
/// never mutate agent state. The selector takes the first choice that still
/// fits, re-validated against the snapshot.
pub type CustomHook =
    Arc<dyn Fn(&ResourceSlots, &str, &PlacementSnapshot) -> Vec<AgentId> + Send + Sync>;

/// Named custom hooks, loaded at startup.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, CustomHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, hook: CustomHook) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn get(&self, name: &str) -> Option<CustomHook> {
        self.hooks.get(name).cloned()
    }
}

/// A named custom hook behind the [`AgentSelector`] interface.
#[derive(Clone)]
pub struct CustomSelector {
    name: String,
    hook: CustomHook,
}

impl CustomSelector {
    pub fn new(name: impl Into<String>, hook: CustomHook) -> Self {
        Self { name: name.into(), hook }
    }
}

impl AgentSelector for CustomSelector {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn select(
        &self,
        need: &ResourceSlots,
        architecture: &str,
        snapshot: &PlacementSnapshot,
    ) -> Option<AgentId> {
        let ranked = (self.hook)(need, architecture, snapshot);
        // First hook choice that still fits.
        ranked.into_iter().find(|id| {
            snapshot
                .free_of(id)
                .is_some_and(|free| need.fits_within(free))
        })
    }
}

impl std::fmt::Debug for CustomSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomSelector").field("name", &self.name).finish()
    }
}

/// Instantiate the configured placement policy.
///
/// `custom` requires the named hook to exist in the registry; config
/// validation guarantees the name is present.
pub fn selector_from_config(
    config: &Config,
    hooks: &HookRegistry,
) -> Result<Box<dyn AgentSelector>, crate::error::SchedError> {
    match config.scheduler.agent_policy {
        AgentPolicyKind::Concentrated => Ok(Box::new(Concentrated)),
        AgentPolicyKind::Dispersed => Ok(Box::new(Dispersed)),
        AgentPolicyKind::Custom => {
            let name = config
                .scheduler
                .custom_agent_hook
                .as_deref()
                .unwrap_or_default();
            let hook = hooks.get(name).ok_or_else(|| {
                crate::error::SchedError::Validation(format!(
                    "custom agent hook '{name}' is not registered"
                ))
            })?;
            Ok(Box::new(CustomSelector::new(name, hook)))
        }
    }
}

/// Joint placement for all kernels of a session.
///
/// Single-node sessions put every kernel on one agent; multi-node sessions
/// run one selection round per kernel, updating the snapshot's free slots in
/// memory between rounds. Any failed round fails the whole attempt; the
/// tentative reservations die with the snapshot clone.
pub fn plan_session(
    session: &Session,
    kernels: &[&Kernel],
    snapshot: &PlacementSnapshot,
    selector: &dyn AgentSelector,
) -> Result<Vec<(KernelId, AgentId)>, String> {
    let mut working = snapshot.clone();
    let mut plan = Vec::with_capacity(kernels.len());

    match session.spec.cluster_mode {
        berth_core::ClusterMode::SingleNode => {
            let need = session.total_requested();
            let agent = selector
                .select(&need, &session.spec.architecture, &working)
                .ok_or_else(|| format!("no agent fits {} kernels jointly", kernels.len()))?;
            if !working.reserve(&agent, &need) {
                return Err(format!("agent {agent} no longer fits the joint request"));
            }
            for kernel in kernels {
                plan.push((kernel.id.clone(), agent.clone()));
            }
        }
        berth_core::ClusterMode::MultiNode => {
            for kernel in kernels {
                let agent = selector
                    .select(&kernel.allocated_slots, &kernel.architecture, &working)
                    .ok_or_else(|| {
                        format!("no agent fits kernel {} (round {})", kernel.id, kernel.cluster_idx)
                    })?;
                if !working.reserve(&agent, &kernel.allocated_slots) {
                    return Err(format!("agent {agent} no longer fits kernel {}", kernel.id));
                }
                plan.push((kernel.id.clone(), agent.clone()));
            }
        }
    }

    Ok(plan)
}

#[cfg(test)]
#[path = "placement_tests.rs"]
mod tests;
