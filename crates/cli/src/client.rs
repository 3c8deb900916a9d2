// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket client for the daemon.

use berth_daemon::lifecycle::Paths;
use berth_daemon::protocol::{
    self, ErrorCode, ProtocolError, Request, Response, DEFAULT_TIMEOUT,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::net::UnixStream;

/// Errors from talking to the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon is not running (no socket at {0})")]
    NotRunning(PathBuf),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{message}")]
    Daemon { code: ErrorCode, message: String },

    #[error("unexpected response from daemon")]
    UnexpectedResponse,
}

impl ClientError {
    /// Map onto operator exit codes: 0 success, 1 generic, 2 not-found,
    /// 3 conflict.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Daemon { code, .. } => code.exit_code(),
            _ => 1,
        }
    }
}

/// One-request-per-connection client, like every other daemon peer.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> Result<Self, ClientError> {
        let paths = Paths::load().map_err(|e| ClientError::Daemon {
            code: ErrorCode::Internal,
            message: e.to_string(),
        })?;
        Ok(Self {
            socket_path: paths.socket_path,
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Send one request, read one response, surface daemon errors as typed
    /// failures.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|_| ClientError::NotRunning(self.socket_path.clone()))?;

        protocol::write_request(&mut stream, &request, DEFAULT_TIMEOUT).await?;
        let response = protocol::read_response(&mut stream, DEFAULT_TIMEOUT).await?;

        match response {
            Response::Error { code, message } => Err(ClientError::Daemon { code, message }),
            other => Ok(other),
        }
    }

    /// Whether a daemon answers on the socket.
    pub async fn is_alive(&self) -> bool {
        matches!(self.request(Request::Ping).await, Ok(Response::Pong))
    }
}
