// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent connection pool with concurrency budgets and deadlines.
//!
//! Every call acquires one permit from the target agent's semaphore: excess
//! calls queue behind the permit, they are never dropped. Every call runs
//! under an explicit deadline; there are no unbounded waits anywhere on the
//! southbound path.

use crate::client::{
    AgentClient, CallEnvelope, ExecMode, ExecOutput, ImageSync, KernelHandle, KernelLaunchSpec,
    RpcError,
};
use berth_core::{AgentId, KernelId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Wraps any [`AgentClient`] with per-agent concurrency budgets.
pub struct AgentPool<C> {
    client: Arc<C>,
    budgets: Mutex<HashMap<AgentId, Arc<Semaphore>>>,
    default_budget: u32,
}

impl<C: AgentClient> AgentPool<C> {
    pub fn new(client: Arc<C>, default_budget: u32) -> Self {
        Self {
            client,
            budgets: Mutex::new(HashMap::new()),
            default_budget: default_budget.max(1),
        }
    }

    pub fn client(&self) -> Arc<C> {
        Arc::clone(&self.client)
    }

    /// Adopt the budget an agent advertised in its heartbeat.
    ///
    /// Only takes effect for agents we haven't issued permits for yet;
    /// re-sizing a live semaphore would strand queued callers.
    pub fn set_budget(&self, agent: &AgentId, budget: u32) {
        let mut budgets = self.budgets.lock();
        budgets
            .entry(agent.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(budget.max(1) as usize)));
    }

    fn semaphore(&self, agent: &AgentId) -> Arc<Semaphore> {
        let mut budgets = self.budgets.lock();
        Arc::clone(
            budgets
                .entry(agent.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.default_budget as usize))),
        )
    }

    async fn run<T, F>(
        &self,
        agent: &AgentId,
        kind: &'static str,
        deadline: Duration,
        call: F,
    ) -> Result<T, RpcError>
    where
        F: std::future::Future<Output = Result<T, RpcError>>,
    {
        let semaphore = self.semaphore(agent);
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Unreachable("agent pool closed".into()))?;
        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| RpcError::Timeout { kind })?
    }

    pub async fn sync_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<ImageSync, RpcError> {
        self.run(agent, "sync_images", deadline, self.client.sync_images(agent, images, envelope))
            .await
    }

    pub async fn await_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<(), RpcError> {
        self.run(agent, "await_images", deadline, self.client.await_images(agent, images, envelope))
            .await
    }

    pub async fn create_kernel(
        &self,
        agent: &AgentId,
        spec: &KernelLaunchSpec,
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<KernelHandle, RpcError> {
        self.run(agent, "create_kernel", deadline, self.client.create_kernel(agent, spec, envelope))
            .await
    }

    pub async fn destroy_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<(), RpcError> {
        self.run(
            agent,
            "destroy_kernel",
            deadline,
            self.client.destroy_kernel(agent, kernel_id, envelope),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn exec(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        run_id: &str,
        mode: ExecMode,
        code: &str,
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<ExecOutput, RpcError> {
        self.run(
            agent,
            "exec",
            deadline,
            self.client.exec(agent, kernel_id, run_id, mode, code, envelope),
        )
        .await
    }

    pub async fn interrupt(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<(), RpcError> {
        self.run(agent, "interrupt", deadline, self.client.interrupt(agent, kernel_id, envelope))
            .await
    }

    pub async fn restart_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
        deadline: Duration,
    ) -> Result<(), RpcError> {
        self.run(
            agent,
            "restart_kernel",
            deadline,
            self.client.restart_kernel(agent, kernel_id, envelope),
        )
        .await
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
