// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake agent client for deterministic testing.
//!
//! Behaves like a fleet of well-behaved agents: containers are "created" in
//! memory, `(kernel_id, attempt_seq)` acks are idempotent, and failures can
//! be scripted per agent or per kernel. Tests assert on the recorded calls,
//! the set of live containers (for leak checks), and the duplicate-create
//! counter (for at-most-once checks).

use crate::client::{
    AgentClient, CallEnvelope, ExecMode, ExecOutput, ImageSync, KernelHandle, KernelLaunchSpec,
    RpcError,
};
use async_trait::async_trait;
use berth_core::{AgentId, KernelId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Recorded call to [`FakeAgentClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCall {
    SyncImages { agent: AgentId },
    AwaitImages { agent: AgentId },
    CreateKernel {
        agent: AgentId,
        kernel_id: KernelId,
        attempt_seq: u32,
    },
    DestroyKernel { agent: AgentId, kernel_id: KernelId },
    Exec { agent: AgentId, kernel_id: KernelId, run_id: String },
    Interrupt { agent: AgentId, kernel_id: KernelId },
    Restart { agent: AgentId, kernel_id: KernelId },
}

#[derive(Default)]
struct FakeState {
    calls: Vec<RpcCall>,
    /// Live containers per agent.
    containers: HashMap<AgentId, HashMap<KernelId, String>>,
    /// Seen `(kernel, attempt)` pairs with the handle they produced.
    acks: HashMap<(KernelId, u32), KernelHandle>,
    /// Creates that produced a second container for an already-created
    /// kernel (a new attempt_seq). Must stay zero in failover tests.
    duplicate_creates: u32,
    /// Agents whose images need a pull before create.
    pulling_agents: HashSet<AgentId>,
    /// Scripted create failures by kernel id (one-shot unless sticky).
    create_failures: HashMap<KernelId, RpcError>,
    /// Scripted failures for whole agents (every call fails).
    down_agents: HashMap<AgentId, RpcError>,
    /// Scripted pull failures.
    pull_failures: HashMap<AgentId, RpcError>,
    container_counter: u64,
}

/// In-memory agent fleet for tests.
#[derive(Clone, Default)]
pub struct FakeAgentClient {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeAgentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RpcCall> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Kernels with a live container on the given agent.
    pub fn containers_on(&self, agent: &AgentId) -> Vec<KernelId> {
        let inner = self.inner.lock();
        let mut ids: Vec<KernelId> = inner
            .containers
            .get(agent)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Total live containers across the fleet (leak checks).
    pub fn total_containers(&self) -> usize {
        self.inner.lock().containers.values().map(HashMap::len).sum()
    }

    /// Creates that violated at-most-once per kernel.
    pub fn duplicate_creates(&self) -> u32 {
        self.inner.lock().duplicate_creates
    }

    /// Script: this agent's images need a pull before create succeeds.
    pub fn set_images_not_local(&self, agent: &AgentId) {
        self.inner.lock().pulling_agents.insert(agent.clone());
    }

    /// Script: creating this kernel fails with the given error.
    pub fn fail_create(&self, kernel_id: &KernelId, error: RpcError) {
        self.inner.lock().create_failures.insert(kernel_id.clone(), error);
    }

    /// Script: every call to this agent fails with the given error.
    pub fn set_agent_down(&self, agent: &AgentId, error: RpcError) {
        self.inner.lock().down_agents.insert(agent.clone(), error);
    }

    pub fn set_agent_up(&self, agent: &AgentId) {
        self.inner.lock().down_agents.remove(agent);
    }

    /// Script: image pulls on this agent fail.
    pub fn fail_pull(&self, agent: &AgentId, error: RpcError) {
        self.inner.lock().pull_failures.insert(agent.clone(), error);
    }

    fn check_agent(state: &FakeState, agent: &AgentId) -> Result<(), RpcError> {
        match state.down_agents.get(agent) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn sync_images(
        &self,
        agent: &AgentId,
        _images: &[String],
        _envelope: &CallEnvelope,
    ) -> Result<ImageSync, RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::SyncImages { agent: agent.clone() });
        Self::check_agent(&inner, agent)?;
        if inner.pulling_agents.contains(agent) {
            Ok(ImageSync::Pulling)
        } else {
            Ok(ImageSync::Local)
        }
    }

    async fn await_images(
        &self,
        agent: &AgentId,
        _images: &[String],
        _envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::AwaitImages { agent: agent.clone() });
        Self::check_agent(&inner, agent)?;
        if let Some(error) = inner.pull_failures.get(agent) {
            return Err(error.clone());
        }
        inner.pulling_agents.remove(agent);
        Ok(())
    }

    async fn create_kernel(
        &self,
        agent: &AgentId,
        spec: &KernelLaunchSpec,
        envelope: &CallEnvelope,
    ) -> Result<KernelHandle, RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::CreateKernel {
            agent: agent.clone(),
            kernel_id: spec.kernel_id.clone(),
            attempt_seq: envelope.attempt_seq,
        });
        Self::check_agent(&inner, agent)?;

        // Idempotent ack: the same attempt returns the original handle
        // without creating anything.
        let key = (spec.kernel_id.clone(), envelope.attempt_seq);
        if let Some(handle) = inner.acks.get(&key) {
            return Ok(handle.clone());
        }

        if let Some(error) = inner.create_failures.get(&spec.kernel_id) {
            return Err(error.clone());
        }

        let already_created = inner
            .containers
            .values()
            .any(|c| c.contains_key(&spec.kernel_id));
        if already_created {
            inner.duplicate_creates += 1;
        }

        inner.container_counter += 1;
        let container_id = format!("cont-{}", inner.container_counter);
        inner
            .containers
            .entry(agent.clone())
            .or_default()
            .insert(spec.kernel_id.clone(), container_id.clone());

        let handle = KernelHandle {
            kernel_id: spec.kernel_id.clone(),
            container_id,
            service_ports: Vec::new(),
        };
        inner.acks.insert(key, handle.clone());
        Ok(handle)
    }

    async fn destroy_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        _envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::DestroyKernel {
            agent: agent.clone(),
            kernel_id: kernel_id.clone(),
        });
        Self::check_agent(&inner, agent)?;
        // Destroying an unknown kernel is a no-op success.
        if let Some(containers) = inner.containers.get_mut(agent) {
            containers.remove(kernel_id);
        }
        Ok(())
    }

    async fn exec(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        run_id: &str,
        _mode: ExecMode,
        code: &str,
        _envelope: &CallEnvelope,
    ) -> Result<ExecOutput, RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::Exec {
            agent: agent.clone(),
            kernel_id: kernel_id.clone(),
            run_id: run_id.to_string(),
        });
        Self::check_agent(&inner, agent)?;
        let known = inner
            .containers
            .get(agent)
            .is_some_and(|c| c.contains_key(kernel_id));
        if !known {
            return Err(RpcError::Rejected(format!("unknown kernel {kernel_id}")));
        }
        Ok(ExecOutput {
            run_id: run_id.to_string(),
            stdout: format!("ran {} bytes", code.len()),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn interrupt(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        _envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::Interrupt {
            agent: agent.clone(),
            kernel_id: kernel_id.clone(),
        });
        Self::check_agent(&inner, agent)
    }

    async fn restart_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        _envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let mut inner = self.inner.lock();
        inner.calls.push(RpcCall::Restart {
            agent: agent.clone(),
            kernel_id: kernel_id.clone(),
        });
        Self::check_agent(&inner, agent)?;
        let known = inner
            .containers
            .get(agent)
            .is_some_and(|c| c.contains_key(kernel_id));
        if !known {
            return Err(RpcError::Rejected(format!("unknown kernel {kernel_id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
