// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire client for worker agents.
//!
//! Speaks the same 4-byte length prefix + JSON framing as the daemon's own
//! IPC, one TCP connection per call. Agent addresses come from the
//! materialized state; deadlines and concurrency are enforced a layer up by
//! the [`berth_rpc::AgentPool`].

use crate::protocol::{read_message, write_message, ProtocolError};
use async_trait::async_trait;
use berth_core::{AgentId, KernelId};
use berth_rpc::{
    AgentClient, CallEnvelope, ExecMode, ExecOutput, ImageSync, KernelHandle, KernelLaunchSpec,
    RpcError,
};
use berth_storage::MaterializedState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpStream;

/// One southbound call on the wire.
#[derive(Debug, Serialize)]
struct AgentCall<'a, T: Serialize> {
    method: &'static str,
    envelope: &'a CallEnvelope,
    payload: T,
}

/// Agent's answer: either a payload or a refusal.
#[derive(Debug, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum AgentReply<T> {
    Ok { payload: T },
    Busy,
    Fenced,
    Rejected { reason: String },
}

#[derive(Debug, Deserialize)]
struct ImageSyncReply {
    pulling: bool,
}

#[derive(Debug, Serialize)]
struct ExecPayload<'a> {
    kernel_id: &'a KernelId,
    run_id: &'a str,
    mode: ExecMode,
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct KernelPayload<'a> {
    kernel_id: &'a KernelId,
}

#[derive(Debug, Serialize)]
struct ImagesPayload<'a> {
    images: &'a [String],
}

/// [`AgentClient`] over TCP, resolving addresses from the shared state.
pub struct WireAgentClient {
    state: Arc<Mutex<MaterializedState>>,
}

impl WireAgentClient {
    pub fn new(state: Arc<Mutex<MaterializedState>>) -> Self {
        Self { state }
    }

    fn addr_of(&self, agent: &AgentId) -> Result<String, RpcError> {
        self.state
            .lock()
            .get_agent(agent.as_str())
            .map(|a| a.addr.clone())
            .ok_or_else(|| RpcError::Unreachable(format!("unknown agent {agent}")))
    }

    async fn call<T: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        agent: &AgentId,
        method: &'static str,
        envelope: &CallEnvelope,
        payload: T,
    ) -> Result<R, RpcError> {
        let addr = self.addr_of(agent)?;
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| RpcError::Unreachable(format!("{agent} at {addr}: {e}")))?;

        let frame = serde_json::to_vec(&AgentCall {
            method,
            envelope,
            payload,
        })
        .map_err(|e| RpcError::Rejected(format!("encode: {e}")))?;

        write_message(&mut stream, &frame)
            .await
            .map_err(|e| io_to_rpc(e, agent))?;
        let answer = read_message(&mut stream)
            .await
            .map_err(|e| io_to_rpc(e, agent))?;

        let reply: AgentReply<R> = serde_json::from_slice(&answer)
            .map_err(|e| RpcError::Rejected(format!("malformed reply: {e}")))?;
        match reply {
            AgentReply::Ok { payload } => Ok(payload),
            AgentReply::Busy => Err(RpcError::Busy),
            AgentReply::Fenced => Err(RpcError::Fenced),
            AgentReply::Rejected { reason } => Err(RpcError::Rejected(reason)),
        }
    }
}

fn io_to_rpc(e: ProtocolError, agent: &AgentId) -> RpcError {
    match e {
        ProtocolError::Timeout => RpcError::Timeout { kind: "wire" },
        other => RpcError::Unreachable(format!("{agent}: {other}")),
    }
}

#[async_trait]
impl AgentClient for WireAgentClient {
    async fn sync_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
    ) -> Result<ImageSync, RpcError> {
        let reply: ImageSyncReply = self
            .call(agent, "sync_images", envelope, ImagesPayload { images })
            .await?;
        Ok(if reply.pulling {
            ImageSync::Pulling
        } else {
            ImageSync::Local
        })
    }

    async fn await_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .call(agent, "await_images", envelope, ImagesPayload { images })
            .await?;
        Ok(())
    }

    async fn create_kernel(
        &self,
        agent: &AgentId,
        spec: &KernelLaunchSpec,
        envelope: &CallEnvelope,
    ) -> Result<KernelHandle, RpcError> {
        self.call(agent, "create_kernel", envelope, spec).await
    }

    async fn destroy_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .call(agent, "destroy_kernel", envelope, KernelPayload { kernel_id })
            .await?;
        Ok(())
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
        self.call(
            agent,
            "exec",
            envelope,
            ExecPayload {
                kernel_id,
                run_id,
                mode,
                code,
            },
        )
        .await
    }

    async fn interrupt(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .call(agent, "interrupt", envelope, KernelPayload { kernel_id })
            .await?;
        Ok(())
    }

    async fn restart_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .call(agent, "restart_kernel", envelope, KernelPayload { kernel_id })
            .await?;
        Ok(())
    }
}
