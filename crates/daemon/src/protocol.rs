// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for daemon communication.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload. The same
//! framing serves the CLI (northbound) and worker daemons publishing
//! heartbeats and kernel events.

use berth_core::{
    Agent, AgentId, KernelId, ResourceGroupId, ResourceSlots, SessionStatus,
};
use berth_rpc::{ExecMode, ExecOutput};
use berth_sched::{EnqueueRequest, ErrorKind, SchedError, SessionQuery, WriteReceipt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default IPC timeout
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Protocol version (from Cargo.toml)
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request from CLI or a worker daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Health check ping
    Ping,

    /// Version handshake
    Hello { version: String },

    /// Queue a new session
    Enqueue { request: EnqueueRequest },

    /// Cancel a pending session
    Cancel { id: String },

    /// Destroy a session wherever it is
    Destroy {
        id: String,
        #[serde(default)]
        forced: bool,
    },

    /// Restart a running session in place
    Restart { id: String },

    /// Interrupt the current run
    Interrupt { id: String, run_id: String },

    /// Execute code on the main kernel
    Exec {
        id: String,
        run_id: String,
        mode: ExecMode,
        code: String,
    },

    /// Full view of one session (id or unique prefix)
    Query { id: String },

    /// Sessions matching a filter
    Match {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<SessionStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name_contains: Option<String>,
    },

    /// Pending queue of a resource group
    ShowQueue { group: ResourceGroupId },

    /// Drain (or undrain) an agent
    DrainAgent { agent_id: String, drain: bool },

    /// Validate accounting totals against the journal
    RecalcUsage,

    /// Ask a group's agents to re-sync their image catalogs
    RescanImages { group: ResourceGroupId },

    // -- worker-published --
    /// First contact from a worker agent
    AgentJoin { agent: Agent },

    /// Periodic worker heartbeat
    AgentHeartbeat {
        agent_id: AgentId,
        reported_slots: ResourceSlots,
        #[serde(default)]
        running_kernels: Vec<KernelId>,
    },

    /// Worker: kernel container is up
    KernelStarted { kernel_id: KernelId },

    /// Worker: kernel exited
    KernelTerminated { kernel_id: KernelId, exit_code: i32 },

    /// Worker: kernel vanished
    KernelLost { kernel_id: KernelId, reason: String },

    /// Get daemon status
    Status,

    /// Request daemon shutdown
    Shutdown,
}

/// Typed error codes, mapped onto CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    Capacity,
    Internal,
}

impl ErrorCode {
    pub fn from_sched(error: &SchedError) -> Self {
        match error {
            SchedError::NotFound(_) => ErrorCode::NotFound,
            SchedError::Conflict(_) => ErrorCode::Conflict,
            SchedError::Capacity(_) => ErrorCode::Capacity,
            _ => match error.kind() {
                ErrorKind::Validation => ErrorCode::BadRequest,
                ErrorKind::Capacity => ErrorCode::Capacity,
                _ => ErrorCode::Internal,
            },
        }
    }

    /// Operator-facing exit code: 0 success, 1 generic, 2 not-found,
    /// 3 conflict.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorCode::NotFound => 2,
            ErrorCode::Conflict => 3,
            _ => 1,
        }
    }
}

/// One pending-queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub entry: SessionQuery,
    /// HoL-avoidance retry counter.
    pub retries: u32,
}

/// Daemon status summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_ms: u64,
    pub sessions: usize,
    pub agents: usize,
    pub processed_seq: u64,
}

/// Response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Pong,
    Hello { version: String },
    Ok,
    Receipt { receipt: WriteReceipt },
    Session { session: Box<SessionQuery> },
    Sessions { sessions: Vec<SessionQuery> },
    Queue { entries: Vec<QueueEntry> },
    Exec { output: ExecOutput },
    Recalc { drift: Vec<String> },
    Rescan { synced: u32 },
    Status { status: DaemonStatus },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(e: &SchedError) -> Self {
        Response::Error {
            code: ErrorCode::from_sched(e),
            message: e.to_string(),
        }
    }
}

/// Encode a message to JSON bytes (without length prefix)
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(json)
}

/// Decode a message from wire format
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a length-prefixed message from an async reader
pub async fn read_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed message to an async writer
pub async fn write_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a request with timeout
pub async fn read_request<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
    timeout: std::time::Duration,
) -> Result<Request, ProtocolError> {
    let bytes = tokio::time::timeout(timeout, read_message(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    decode(&bytes)
}

/// Write a response with timeout
pub async fn write_response<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    response: &Response,
    timeout: std::time::Duration,
) -> Result<(), ProtocolError> {
    let data = encode(response)?;
    tokio::time::timeout(timeout, write_message(writer, &data))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Write a request with timeout (client side)
pub async fn write_request<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    request: &Request,
    timeout: std::time::Duration,
) -> Result<(), ProtocolError> {
    let data = encode(request)?;
    tokio::time::timeout(timeout, write_message(writer, &data))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

/// Read a response with timeout (client side)
pub async fn read_response<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
    timeout: std::time::Duration,
) -> Result<Response, ProtocolError> {
    let bytes = tokio::time::timeout(timeout, read_message(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    decode(&bytes)
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
