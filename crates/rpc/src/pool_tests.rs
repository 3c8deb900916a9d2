// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::client::{CallEnvelope, RpcError};
use crate::fake::FakeAgentClient;
use berth_core::{AgentId, RequestId};
use std::time::Duration;

fn envelope() -> CallEnvelope {
    CallEnvelope::new(RequestId::new("req-1"), 1, 1)
}

#[tokio::test]
async fn pool_passes_calls_through() {
    let fake = Arc::new(FakeAgentClient::new());
    let pool = AgentPool::new(Arc::clone(&fake), 2);
    let agent = AgentId::new("agent-x");

    let sync = pool
        .sync_images(&agent, &[], &envelope(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(sync, crate::client::ImageSync::Local);
    assert_eq!(fake.calls().len(), 1);
}

#[tokio::test]
async fn deadline_exceeded_maps_to_timeout() {
    // A client that never answers.
    struct Stuck;
    #[async_trait::async_trait]
    impl AgentClient for Stuck {
        async fn sync_images(
            &self,
            _: &AgentId,
            _: &[String],
            _: &CallEnvelope,
        ) -> Result<ImageSync, RpcError> {
            std::future::pending().await
        }
        async fn await_images(
            &self,
            _: &AgentId,
            _: &[String],
            _: &CallEnvelope,
        ) -> Result<(), RpcError> {
            std::future::pending().await
        }
        async fn create_kernel(
            &self,
            _: &AgentId,
            _: &KernelLaunchSpec,
            _: &CallEnvelope,
        ) -> Result<KernelHandle, RpcError> {
            std::future::pending().await
        }
        async fn destroy_kernel(
            &self,
            _: &AgentId,
            _: &KernelId,
            _: &CallEnvelope,
        ) -> Result<(), RpcError> {
            std::future::pending().await
        }
        async fn exec(
            &self,
            _: &AgentId,
            _: &KernelId,
            _: &str,
            _: ExecMode,
            _: &str,
            _: &CallEnvelope,
        ) -> Result<ExecOutput, RpcError> {
            std::future::pending().await
        }
        async fn interrupt(&self, _: &AgentId, _: &KernelId, _: &CallEnvelope) -> Result<(), RpcError> {
            std::future::pending().await
        }
        async fn restart_kernel(
            &self,
            _: &AgentId,
            _: &KernelId,
            _: &CallEnvelope,
        ) -> Result<(), RpcError> {
            std::future::pending().await
        }
    }

    let pool = AgentPool::new(Arc::new(Stuck), 1);
    let err = pool
        .sync_images(&AgentId::new("agent-x"), &[], &envelope(), Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::Timeout { kind: "sync_images" });
}

#[tokio::test]
async fn budget_queues_excess_calls_without_dropping() {
    use std::sync::atomic::{AtomicU32, Ordering};

    // A client that records its own in-flight high-water mark.
    #[derive(Default)]
    struct Gauged {
        in_flight: AtomicU32,
        peak: AtomicU32,
    }
    #[async_trait::async_trait]
    impl AgentClient for Gauged {
        async fn sync_images(
            &self,
            _: &AgentId,
            _: &[String],
            _: &CallEnvelope,
        ) -> Result<ImageSync, RpcError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ImageSync::Local)
        }
        async fn await_images(&self, _: &AgentId, _: &[String], _: &CallEnvelope) -> Result<(), RpcError> {
            Ok(())
        }
        async fn create_kernel(
            &self,
            _: &AgentId,
            _: &KernelLaunchSpec,
            _: &CallEnvelope,
        ) -> Result<KernelHandle, RpcError> {
            Err(RpcError::Busy)
        }
        async fn destroy_kernel(&self, _: &AgentId, _: &KernelId, _: &CallEnvelope) -> Result<(), RpcError> {
            Ok(())
        }
        async fn exec(
            &self,
            _: &AgentId,
            _: &KernelId,
            _: &str,
            _: ExecMode,
            _: &str,
            _: &CallEnvelope,
        ) -> Result<ExecOutput, RpcError> {
            Ok(ExecOutput::default())
        }
        async fn interrupt(&self, _: &AgentId, _: &KernelId, _: &CallEnvelope) -> Result<(), RpcError> {
            Ok(())
        }
        async fn restart_kernel(&self, _: &AgentId, _: &KernelId, _: &CallEnvelope) -> Result<(), RpcError> {
            Ok(())
        }
    }

    let gauged = Arc::new(Gauged::default());
    let pool = Arc::new(AgentPool::new(Arc::clone(&gauged), 2));
    let agent = AgentId::new("agent-x");

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let pool = Arc::clone(&pool);
        let agent = agent.clone();
        tasks.push(tokio::spawn(async move {
            pool.sync_images(&agent, &[], &envelope(), Duration::from_secs(5)).await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    // All six calls completed, never more than the budget at once.
    assert_eq!(gauged.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn advertised_budget_is_adopted_for_new_agents() {
    let fake = Arc::new(FakeAgentClient::new());
    let pool = AgentPool::new(fake, 4);
    let agent = AgentId::new("agent-x");
    pool.set_budget(&agent, 1);
    // No assertion beyond "doesn't panic and still serves": the semaphore
    // size is internal; behavior is covered by the gauged test above.
    pool.sync_images(&agent, &[], &envelope(), Duration::from_secs(1)).await.unwrap();
}
