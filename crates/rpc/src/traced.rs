// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Traced client wrapper for consistent observability.

use crate::client::{
    AgentClient, CallEnvelope, ExecMode, ExecOutput, ImageSync, KernelHandle, KernelLaunchSpec,
    RpcError,
};
use async_trait::async_trait;
use berth_core::{AgentId, KernelId};
use tracing::Instrument;

/// Wrapper that adds tracing to any [`AgentClient`].
#[derive(Clone)]
pub struct TracedClient<C> {
    inner: C,
}

impl<C> TracedClient<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C> TracedClient<C> {
    async fn timed<T>(
        kind: &'static str,
        fut: impl std::future::Future<Output = Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        let start = std::time::Instant::now();
        let result = fut.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(elapsed_ms, "completed"),
            Err(e) if e.is_retriable() => tracing::warn!(elapsed_ms, error = %e, "{kind} failed (retriable)"),
            Err(e) => tracing::error!(elapsed_ms, error = %e, "{kind} failed"),
        }
        result
    }
}

#[async_trait]
impl<C: AgentClient> AgentClient for TracedClient<C> {
    async fn sync_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
    ) -> Result<ImageSync, RpcError> {
        Self::timed("sync_images", self.inner.sync_images(agent, images, envelope))
            .instrument(tracing::info_span!("rpc.sync_images", agent = %agent, images = images.len()))
            .await
    }

    async fn await_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        Self::timed("await_images", self.inner.await_images(agent, images, envelope))
            .instrument(tracing::info_span!("rpc.await_images", agent = %agent))
            .await
    }

    async fn create_kernel(
        &self,
        agent: &AgentId,
        spec: &KernelLaunchSpec,
        envelope: &CallEnvelope,
    ) -> Result<KernelHandle, RpcError> {
        Self::timed("create_kernel", self.inner.create_kernel(agent, spec, envelope))
            .instrument(tracing::info_span!(
                "rpc.create_kernel",
                agent = %agent,
                kernel = %spec.kernel_id,
                attempt = envelope.attempt_seq,
            ))
            .await
    }

    async fn destroy_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        Self::timed("destroy_kernel", self.inner.destroy_kernel(agent, kernel_id, envelope))
            .instrument(tracing::info_span!("rpc.destroy_kernel", agent = %agent, kernel = %kernel_id))
            .await
    }

    async fn exec(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        run_id: &str,
        mode: ExecMode,
        code: &str,
        envelope: &CallEnvelope,
    ) -> Result<ExecOutput, RpcError> {
        Self::timed("exec", self.inner.exec(agent, kernel_id, run_id, mode, code, envelope))
            .instrument(tracing::info_span!(
                "rpc.exec",
                agent = %agent,
                kernel = %kernel_id,
                run_id,
                mode = %mode,
            ))
            .await
    }

    async fn interrupt(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        Self::timed("interrupt", self.inner.interrupt(agent, kernel_id, envelope))
            .instrument(tracing::info_span!("rpc.interrupt", agent = %agent, kernel = %kernel_id))
            .await
    }

    async fn restart_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        Self::timed("restart_kernel", self.inner.restart_kernel(agent, kernel_id, envelope))
            .instrument(tracing::info_span!("rpc.restart_kernel", agent = %agent, kernel = %kernel_id))
            .await
    }
}
