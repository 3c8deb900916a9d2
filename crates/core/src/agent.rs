// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker agent record.

use crate::id::{AgentId, ResourceGroupId};
use crate::slot::ResourceSlots;
use serde::{Deserialize, Serialize};

/// Liveness of an agent as seen by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Alive,
    /// Heartbeats stopped; kernels may still be running.
    Lost,
    /// Deregistered; never schedules again.
    Terminated,
}

crate::simple_display! {
    AgentStatus {
        Alive => "alive",
        Lost => "lost",
        Terminated => "terminated",
    }
}

/// One worker node of the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// RPC address, e.g. "10.0.3.7:6011".
    pub addr: String,
    pub resource_group: ResourceGroupId,
    pub architecture: String,
    pub total_slots: ResourceSlots,
    /// Maintained by the accounting ledger, confirmed by heartbeats.
    pub occupied_slots: ResourceSlots,
    pub status: AgentStatus,
    /// Max create RPCs the agent accepts concurrently.
    pub concurrency_budget: u32,
    /// Compute plugins the agent loaded ("cuda", "rocm", …).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,
    /// Draining agents finish their kernels but accept no new ones.
    #[serde(default)]
    pub draining: bool,
    pub last_heartbeat_ms: u64,
}

impl Agent {
    /// Slots still free on this agent.
    pub fn free_slots(&self) -> ResourceSlots {
        self.total_slots
            .subtracted(&self.occupied_slots)
            .unwrap_or_default()
    }

    /// Whether the scheduler may place new kernels here.
    pub fn schedulable(&self) -> bool {
        self.status == AgentStatus::Alive && !self.draining
    }
}

crate::builder! {
    pub struct AgentBuilder => Agent {
        into {
            id: AgentId = "agent-1",
            addr: String = "127.0.0.1:6011",
            resource_group: ResourceGroupId = "default",
            architecture: String = "x86_64",
        }
        set {
            total_slots: ResourceSlots = crate::test_support::slots(&[("cpu", 8_000), ("mem", 16 << 30)]),
            occupied_slots: ResourceSlots = ResourceSlots::new(),
            status: AgentStatus = AgentStatus::Alive,
            concurrency_budget: u32 = 4,
            plugins: Vec<String> = Vec::new(),
            draining: bool = false,
            last_heartbeat_ms: u64 = 0,
        }
    }
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
