// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Kernel record: one container of a session.

use crate::id::{AgentId, KernelId, SessionId};
use crate::slot::ResourceSlots;
use serde::{Deserialize, Serialize};

/// Role of a kernel within its session's cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelRole {
    /// Exactly one per session, cluster index 1.
    Main,
    Sub,
}

crate::simple_display! {
    KernelRole {
        Main => "main",
        Sub => "sub",
    }
}

/// Lifecycle status of a kernel. Coarser than the session machine: the
/// session status is derived from the aggregate of its kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    Pending,
    Creating,
    Running,
    Terminated,
    /// The owning agent stopped reporting it.
    Lost,
    Error,
}

crate::simple_display! {
    KernelStatus {
        Pending => "pending",
        Creating => "creating",
        Running => "running",
        Terminated => "terminated",
        Lost => "lost",
        Error => "error",
    }
}

impl KernelStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, KernelStatus::Terminated | KernelStatus::Error)
    }
}

/// A service port exposed by a running kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub name: String,
    pub container_port: u16,
    pub host_port: u16,
}

/// The durable kernel record.
///
/// Kernels live in an arena keyed by [`KernelId`]; the session holds ids,
/// never the records themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub id: KernelId,
    pub session_id: SessionId,
    pub role: KernelRole,
    /// 1-based, unique within the session.
    pub cluster_idx: u32,
    pub image: String,
    pub architecture: String,
    pub allocated_slots: ResourceSlots,
    pub status: KernelStatus,
    /// Assigned by the scheduler; `None` until placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Set once the agent has created the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Highest dispatch attempt issued for this kernel. Together with the
    /// kernel id this keys the at-most-once create guarantee.
    #[serde(default)]
    pub attempt_seq: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_ports: Vec<ServicePort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Kernel {
    /// Seed the kernels of a freshly enqueued session.
    ///
    /// Index `i == 0` is the main kernel; cluster indexes are 1-based.
    pub fn seed(
        ids: &[KernelId],
        session_id: &SessionId,
        image: &str,
        architecture: &str,
        per_kernel: &ResourceSlots,
    ) -> Vec<Kernel> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| Kernel {
                id: id.clone(),
                session_id: session_id.clone(),
                role: if i == 0 { KernelRole::Main } else { KernelRole::Sub },
                cluster_idx: i as u32 + 1,
                image: image.to_string(),
                architecture: architecture.to_string(),
                allocated_slots: per_kernel.clone(),
                status: KernelStatus::Pending,
                agent_id: None,
                container_id: None,
                attempt_seq: 0,
                service_ports: Vec::new(),
                error: None,
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "kernel_tests.rs"]
mod tests;
