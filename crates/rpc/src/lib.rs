// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! berth-rpc: the southbound seam to worker agents.
//!
//! [`AgentClient`] abstracts the per-agent RPC surface (image sync, kernel
//! create/destroy, exec, interrupt, restart); every call carries a
//! [`CallEnvelope`] with `(request_id, attempt_seq, fenced_token)` so agents
//! can acknowledge duplicates idempotently and refuse deposed leaders.
//! [`AgentPool`] enforces per-agent concurrency budgets and deadlines on top
//! of any client. The wire transport behind a production client is out of
//! scope here; tests use the in-memory fake.

mod client;
mod pool;
mod traced;

pub use client::{
    AgentClient, CallEnvelope, ExecMode, ExecOutput, ImageSync, KernelHandle, KernelLaunchSpec,
    RpcError,
};
pub use pool::AgentPool;
pub use traced::TracedClient;

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::{FakeAgentClient, RpcCall};
