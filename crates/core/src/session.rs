// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session record and state machine.
//!
//! The status graph below is the single source of truth for legal
//! transitions; every durable status change goes through
//! [`SessionStatus::can_transition_to`] and the storage layer's
//! compare-and-set `transit` operation.

use crate::id::{KernelId, ResourceGroupId, SessionId};
use crate::scope::Owner;
use crate::slot::ResourceSlots;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Enqueued, waiting for the scheduler to place it.
    Pending,
    /// Agents picked, kernels assigned; waiting for dispatch.
    Scheduled,
    /// Dispatch started; agents are staging the kernels.
    Preparing,
    /// One or more images are being pulled on an agent.
    Pulling,
    /// All images present; containers not yet created.
    Prepared,
    /// Container-create RPCs are in flight.
    Creating,
    /// All kernels reported alive.
    Running,
    /// User-requested restart in progress.
    Restarting,
    /// A subset of kernels was lost; the rest keep running.
    RunningDegraded,
    /// Teardown in progress.
    Terminating,
    /// All kernels gone; retained for audit until swept.
    Terminated,
    /// Dropped from the queue before ever being scheduled.
    Cancelled,
    /// Fatal dispatch or runtime failure.
    Error,
}

crate::simple_display! {
    SessionStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        Preparing => "preparing",
        Pulling => "pulling",
        Prepared => "prepared",
        Creating => "creating",
        Running => "running",
        Restarting => "restarting",
        RunningDegraded => "running_degraded",
        Terminating => "terminating",
        Terminated => "terminated",
        Cancelled => "cancelled",
        Error => "error",
    }
}

impl SessionStatus {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Terminated | SessionStatus::Cancelled | SessionStatus::Error
        )
    }

    /// True while the session occupies (or is about to occupy) agent capacity.
    pub fn holds_resources(&self) -> bool {
        !matches!(self, SessionStatus::Pending) && !self.is_terminal()
    }

    /// Whether `self → next` is a declared edge of the state machine.
    ///
    /// Two blanket edges apply to every non-terminal state: `→ Error` on
    /// fatal failure and `→ Terminating` on forced destroy. Everything else
    /// is enumerated.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Error || next == Terminating {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Preparing)
                | (Preparing, Pulling)
                | (Preparing, Creating)
                | (Pulling, Prepared)
                | (Prepared, Creating)
                | (Creating, Running)
                | (Running, Restarting)
                | (Running, RunningDegraded)
                | (Restarting, Running)
                | (RunningDegraded, Running)
                | (Terminating, Terminated)
        )
    }
}

/// Why a transition was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("illegal transition {from} -> {to} for session {id}")]
    IllegalEdge {
        id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },
    /// Compare-and-set lost: another writer moved the session first.
    /// The caller must reload and retry or abort.
    #[error("stale transition for session {id}: expected {expected}, found {actual}")]
    Stale {
        id: SessionId,
        expected: SessionStatus,
        actual: SessionStatus,
    },
}

/// Broad classification of a session's workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Interactive,
    Batch,
    Inference,
    System,
}

crate::simple_display! {
    SessionType {
        Interactive => "interactive",
        Batch => "batch",
        Inference => "inference",
        System => "system",
    }
}

/// Per-type session data. Variants carry only what the type actually uses;
/// there is no bag of optional attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionKind {
    Interactive {
        /// Terminate after this much inactivity (policy default when absent).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idle_timeout_ms: Option<u64>,
    },
    Batch {
        /// Sessions that must finish successfully before this one is eligible.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        dependencies: Vec<SessionId>,
        /// Earliest eligible time. A value in the past means "eligible now".
        #[serde(default, skip_serializing_if = "Option::is_none")]
        starts_at_ms: Option<u64>,
    },
    Inference {
        replicas: u32,
    },
    System,
}

impl SessionKind {
    pub fn session_type(&self) -> SessionType {
        match self {
            SessionKind::Interactive { .. } => SessionType::Interactive,
            SessionKind::Batch { .. } => SessionType::Batch,
            SessionKind::Inference { .. } => SessionType::Inference,
            SessionKind::System => SessionType::System,
        }
    }

    pub fn dependencies(&self) -> &[SessionId] {
        match self {
            SessionKind::Batch { dependencies, .. } => dependencies,
            _ => &[],
        }
    }

    pub fn starts_at_ms(&self) -> Option<u64> {
        match self {
            SessionKind::Batch { starts_at_ms, .. } => *starts_at_ms,
            _ => None,
        }
    }
}

/// How kernels of one session may be spread over agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// All kernels on one agent.
    SingleNode,
    /// Each kernel may land on a different agent.
    MultiNode,
}

crate::simple_display! {
    ClusterMode {
        SingleNode => "single_node",
        MultiNode => "multi_node",
    }
}

/// Outcome of a finished session, used for batch dependency gating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    #[default]
    Unfinished,
    Success,
    Failure,
}

crate::simple_display! {
    SessionResult {
        Unfinished => "unfinished",
        Success => "success",
        Failure => "failure",
    }
}

/// What a client submits to `enqueue_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    /// Human name, unique among the owner's live sessions.
    pub name: String,
    pub owner: Owner,
    pub resource_group: ResourceGroupId,
    /// Requested slots **per kernel**.
    pub requested_slots: ResourceSlots,
    /// Container image reference, e.g. "cr.example.com/python:3.12".
    pub image: String,
    pub architecture: String,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    pub kind: SessionKind,
    /// Higher runs earlier under the priority queue policy.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environ: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_script: Option<String>,
    /// Opaque virtual-folder references; the data path is out of scope here.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime_ms: Option<u64>,
}

/// One append-only status history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    /// Per-session sequence number; consumers order by this.
    pub seq: u64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at_ms: u64,
}

/// The durable session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub spec: SessionSpec,
    pub status: SessionStatus,
    /// Bumped on every status write; the CAS column for `transit`.
    pub status_version: u64,
    pub result: SessionResult,
    /// Kernels of this session, stable ids into the kernel arena.
    pub kernel_ids: Vec<KernelId>,
    pub enqueued_at_ms: u64,
    pub status_changed_at_ms: u64,
    /// Epoch ms of the last observed activity (exec, heartbeat attribution).
    pub last_active_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Session {
    pub fn new(id: SessionId, spec: SessionSpec, kernel_ids: Vec<KernelId>, at_ms: u64) -> Self {
        Self {
            id,
            spec,
            status: SessionStatus::Pending,
            status_version: 0,
            result: SessionResult::Unfinished,
            kernel_ids,
            enqueued_at_ms: at_ms,
            status_changed_at_ms: at_ms,
            last_active_at_ms: at_ms,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Total slots over all kernels of this session.
    pub fn total_requested(&self) -> ResourceSlots {
        let mut total = ResourceSlots::new();
        for _ in 0..self.spec.cluster_size {
            total = total.added(&self.spec.requested_slots);
        }
        total
    }

    /// Effective idle timeout (spec override, else policy default).
    pub fn idle_timeout_ms(&self, policy_default: Option<u64>) -> Option<u64> {
        match &self.spec.kind {
            SessionKind::Interactive { idle_timeout_ms } => {
                idle_timeout_ms.or(policy_default)
            }
            _ => None,
        }
    }
}

crate::builder! {
    pub struct SessionSpecBuilder => SessionSpec {
        into {
            name: String = "test-session",
            resource_group: ResourceGroupId = "default",
            image: String = "cr.example.com/python:3.12",
            architecture: String = "x86_64",
        }
        set {
            owner: Owner = crate::test_support::owner("ak-test"),
            requested_slots: ResourceSlots = crate::test_support::slots(&[("cpu", 1_000), ("mem", 1 << 30)]),
            cluster_mode: ClusterMode = ClusterMode::SingleNode,
            cluster_size: u32 = 1,
            kind: SessionKind = SessionKind::Interactive { idle_timeout_ms: None },
            priority: i32 = 0,
            environ: HashMap<String, String> = HashMap::new(),
            mounts: Vec<String> = Vec::new(),
        }
        option {
            bootstrap_script: String = None,
            max_lifetime_ms: u64 = None,
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
