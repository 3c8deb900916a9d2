// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The agent RPC surface and its call envelope.

use async_trait::async_trait;
use berth_core::{AgentId, KernelId, RequestId, ResourceSlots, ServicePort, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors from southbound RPCs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Deadline exceeded; the agent may or may not have acted.
    #[error("rpc timeout: {kind}")]
    Timeout { kind: &'static str },
    /// Could not reach the agent at all.
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    /// The agent is at capacity; retry later.
    #[error("agent busy")]
    Busy,
    /// The agent refused the request; retrying cannot help.
    #[error("rejected by agent: {0}")]
    Rejected(String),
    /// The agent no longer honors our lease token.
    #[error("fenced: agent saw a newer leader token")]
    Fenced,
}

impl RpcError {
    /// Whether the dispatch layer may retry this error internally.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout { .. } | RpcError::Unreachable(_) | RpcError::Busy
        )
    }
}

/// Carried by every southbound call.
///
/// `(kernel_id, attempt_seq)` on the payload plus the `request_id` here give
/// agents everything needed for idempotent acknowledgment; `token` lets them
/// refuse calls from a deposed scheduler leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub request_id: RequestId,
    pub attempt_seq: u32,
    pub token: u64,
}

impl CallEnvelope {
    pub fn new(request_id: RequestId, attempt_seq: u32, token: u64) -> Self {
        Self {
            request_id,
            attempt_seq,
            token,
        }
    }
}

/// Outcome of an image sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSync {
    /// All images already present on the agent.
    Local,
    /// A pull was started; await completion separately.
    Pulling,
}

/// Everything an agent needs to create one kernel container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelLaunchSpec {
    pub kernel_id: KernelId,
    pub session_id: SessionId,
    pub image: String,
    pub architecture: String,
    pub slots: ResourceSlots,
    pub cluster_role: String,
    pub cluster_idx: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environ: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_script: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<String>,
}

/// Returned by a successful kernel create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelHandle {
    pub kernel_id: KernelId,
    pub container_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_ports: Vec<ServicePort>,
}

/// Execution mode for code submitted to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    Query,
    Batch,
}

berth_core::simple_display! {
    ExecMode {
        Query => "query",
        Batch => "batch",
    }
}

/// Collected output of an exec call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub run_id: String,
    pub stdout: String,
    pub stderr: String,
    /// Present once the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// The southbound RPC surface of one worker agent.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to call
/// concurrently; ordering guarantees are provided by callers (the dispatch
/// coordinator issues same-agent creates strictly in sequence).
#[async_trait]
pub trait AgentClient: Send + Sync + 'static {
    /// Ensure the given images exist on the agent.
    async fn sync_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
    ) -> Result<ImageSync, RpcError>;

    /// Wait until a previously started pull completes.
    async fn await_images(
        &self,
        agent: &AgentId,
        images: &[String],
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError>;

    /// Create a kernel container. Idempotent per `(kernel_id, attempt_seq)`:
    /// re-sending the same attempt returns the original handle.
    async fn create_kernel(
        &self,
        agent: &AgentId,
        spec: &KernelLaunchSpec,
        envelope: &CallEnvelope,
    ) -> Result<KernelHandle, RpcError>;

    /// Destroy a kernel container. Destroying an unknown kernel succeeds.
    async fn destroy_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError>;

    /// Run code inside a kernel.
    async fn exec(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        run_id: &str,
        mode: ExecMode,
        code: &str,
        envelope: &CallEnvelope,
    ) -> Result<ExecOutput, RpcError>;

    /// Interrupt the current run of a kernel.
    async fn interrupt(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError>;

    /// Restart a kernel container in place.
    async fn restart_kernel(
        &self,
        agent: &AgentId,
        kernel_id: &KernelId,
        envelope: &CallEnvelope,
    ) -> Result<(), RpcError>;
}
