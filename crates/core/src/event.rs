// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event vocabulary for the manager.
//!
//! Every durable fact is an event: enqueues, status changes, agent
//! heartbeats, accounting deltas. Events are written to the WAL before they
//! are applied, so replaying the log from a snapshot reproduces the exact
//! materialized state.
//!
//! Serializes with `{"type": "noun:verb", ...fields}` format.
//! Unknown type tags deserialize to `Custom`.

use crate::agent::{Agent, AgentStatus};
use crate::id::{AgentId, KernelId, ResourceGroupId, SessionId, ShortId};
use crate::kernel::{KernelStatus, ServicePort};
use crate::scope::Scope;
use crate::session::{SessionResult, SessionSpec, SessionStatus};
use crate::slot::ResourceSlots;
use serde::{Deserialize, Serialize};

/// Side of a double-entry accounting delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountingDirection {
    /// Capacity taken (session scheduled / kernel confirmed).
    Reserve,
    /// Capacity returned (kernel terminated or errored).
    Release,
}

crate::simple_display! {
    AccountingDirection {
        Reserve => "reserve",
        Release => "release",
    }
}

/// An account in the double-entry ledger: the agent side or a scope side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum LedgerAccount {
    Agent(AgentId),
    Scope(Scope),
}

impl std::fmt::Display for LedgerAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerAccount::Agent(id) => write!(f, "agent:{id}"),
            LedgerAccount::Scope(s) => write!(f, "{s}"),
        }
    }
}

/// Events that drive state transitions in the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // -- session --
    #[serde(rename = "session:enqueued")]
    SessionEnqueued {
        id: SessionId,
        spec: SessionSpec,
        /// Kernel ids pre-generated by the caller so replay is deterministic.
        kernel_ids: Vec<KernelId>,
        at_ms: u64,
    },

    /// The one and only way a session status changes durably.
    #[serde(rename = "session:status")]
    SessionStatusChanged {
        id: SessionId,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Set when the change also finalizes the batch result.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<SessionResult>,
        at_ms: u64,
    },

    /// Activity marker for idle-timeout tracking.
    #[serde(rename = "session:touched")]
    SessionTouched { id: SessionId, at_ms: u64 },

    // -- kernel --
    #[serde(rename = "kernel:assigned")]
    KernelAssigned {
        kernel_id: KernelId,
        agent_id: AgentId,
    },

    /// A dispatch attempt was issued. `(kernel_id, attempt_seq)` keys the
    /// at-most-once create guarantee across leader changes.
    #[serde(rename = "kernel:dispatch")]
    KernelDispatchStarted {
        kernel_id: KernelId,
        attempt_seq: u32,
    },

    #[serde(rename = "kernel:created")]
    KernelCreated {
        kernel_id: KernelId,
        container_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        service_ports: Vec<ServicePort>,
    },

    #[serde(rename = "kernel:status")]
    KernelStatusChanged {
        kernel_id: KernelId,
        status: KernelStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // -- agent --
    /// First heartbeat from a previously unknown agent.
    #[serde(rename = "agent:joined")]
    AgentJoined { agent: Agent },

    #[serde(rename = "agent:heartbeat")]
    AgentHeartbeat {
        agent_id: AgentId,
        /// Occupancy as the agent itself sees it, for drift detection.
        reported_slots: ResourceSlots,
        /// Kernels the agent believes it is running, for orphan sweeps.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        running_kernels: Vec<KernelId>,
        at_ms: u64,
    },

    #[serde(rename = "agent:status")]
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    #[serde(rename = "agent:drain")]
    AgentDrainSet { agent_id: AgentId, draining: bool },

    // -- accounting --
    /// One leg of a double-entry accounting delta. Writes carrying a fenced
    /// token older than the account's high-water mark are rejected on apply.
    #[serde(rename = "ledger:delta")]
    LedgerDelta {
        account: LedgerAccount,
        session_id: SessionId,
        kernel_id: KernelId,
        slots: ResourceSlots,
        direction: AccountingDirection,
        /// Fenced token of the leader that wrote this entry.
        token: u64,
    },

    // -- scheduler bookkeeping --
    /// HoL-avoidance retry counter for a pending session (0 resets).
    #[serde(rename = "sched:retry")]
    SchedulerRetryNoted {
        group: ResourceGroupId,
        session_id: SessionId,
        retries: u32,
    },

    /// A scheduling cycle ran for the group.
    #[serde(rename = "sched:cycle")]
    SchedulerCycleNoted {
        group: ResourceGroupId,
        at_ms: u64,
    },

    /// Catch-all for unknown event types (extensibility)
    #[serde(other, skip_serializing)]
    Custom,
}

impl Event {
    /// Event bus topic this event publishes on.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::SessionEnqueued { .. }
            | Event::SessionStatusChanged { .. }
            | Event::SessionTouched { .. } => "session.status",
            Event::KernelAssigned { .. }
            | Event::KernelDispatchStarted { .. }
            | Event::KernelCreated { .. }
            | Event::KernelStatusChanged { .. } => "kernel.status",
            Event::AgentJoined { .. }
            | Event::AgentHeartbeat { .. }
            | Event::AgentStatusChanged { .. }
            | Event::AgentDrainSet { .. } => "agent.status",
            Event::LedgerDelta { .. }
            | Event::SchedulerRetryNoted { .. }
            | Event::SchedulerCycleNoted { .. }
            | Event::Custom => "scheduler.tick",
        }
    }

    /// Short human summary for log lines.
    pub fn log_summary(&self) -> String {
        match self {
            Event::SessionEnqueued { id, spec, .. } => {
                format!("session:enqueued {} name={}", id.short(8), spec.name)
            }
            Event::SessionStatusChanged { id, status, reason, .. } => match reason {
                Some(r) => format!("session:status {} -> {status} ({r})", id.short(8)),
                None => format!("session:status {} -> {status}", id.short(8)),
            },
            Event::SessionTouched { id, .. } => format!("session:touched {}", id.short(8)),
            Event::KernelAssigned { kernel_id, agent_id } => {
                format!("kernel:assigned {} -> {agent_id}", kernel_id.short(8))
            }
            Event::KernelDispatchStarted { kernel_id, attempt_seq } => {
                format!("kernel:dispatch {} attempt={attempt_seq}", kernel_id.short(8))
            }
            Event::KernelCreated { kernel_id, container_id, .. } => {
                format!("kernel:created {} container={}", kernel_id.short(8), container_id.short(12))
            }
            Event::KernelStatusChanged { kernel_id, status, .. } => {
                format!("kernel:status {} -> {status}", kernel_id.short(8))
            }
            Event::AgentJoined { agent } => format!("agent:joined {}", agent.id),
            Event::AgentHeartbeat { agent_id, .. } => format!("agent:heartbeat {agent_id}"),
            Event::AgentStatusChanged { agent_id, status, .. } => {
                format!("agent:status {agent_id} -> {status}")
            }
            Event::AgentDrainSet { agent_id, draining } => {
                format!("agent:drain {agent_id} draining={draining}")
            }
            Event::LedgerDelta { account, kernel_id, direction, .. } => {
                format!("ledger:delta {direction} {account} kernel={}", kernel_id.short(8))
            }
            Event::SchedulerRetryNoted { session_id, retries, .. } => {
                format!("sched:retry {} retries={retries}", session_id.short(8))
            }
            Event::SchedulerCycleNoted { group, .. } => format!("sched:cycle {group}"),
            Event::Custom => "custom".to_string(),
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
