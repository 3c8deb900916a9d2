// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task for handling socket I/O.
//!
//! Runs in a spawned task, accepting connections and serving them without
//! blocking the engine loop. Write requests go through the northbound ops
//! facade; worker-published messages turn into events on the bus.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use berth_storage::MaterializedState;

use crate::event_bus::EventBus;
use crate::lifecycle::DaemonOps;
use crate::protocol::{
    self, DaemonStatus, QueueEntry, Request, Response, DEFAULT_TIMEOUT, PROTOCOL_VERSION,
};

/// Shared daemon context for all request handlers.
pub struct ListenCtx {
    pub ops: Arc<DaemonOps>,
    pub state: Arc<Mutex<MaterializedState>>,
    pub event_bus: EventBus,
    pub start_time: Instant,
    pub shutdown: Arc<Notify>,
}

/// Listener task for accepting socket connections.
pub struct Listener {
    socket: UnixListener,
    ctx: Arc<ListenCtx>,
}

/// Errors from connection handling.
#[derive(Debug, Error)]
enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),
}

impl Listener {
    pub fn new(socket: UnixListener, ctx: Arc<ListenCtx>) -> Self {
        Self { socket, ctx }
    }

    /// Run the accept loop, spawning a task per connection.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &ctx).await {
                            match e {
                                ConnectionError::Protocol(
                                    protocol::ProtocolError::ConnectionClosed,
                                ) => debug!("client disconnected"),
                                ConnectionError::Protocol(protocol::ProtocolError::Timeout) => {
                                    warn!("connection timeout")
                                }
                                _ => error!("connection error: {}", e),
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                }
            }
        }
    }
}

/// Handle a single client connection (one request, one response).
async fn handle_connection(stream: UnixStream, ctx: &ListenCtx) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();

    let request = protocol::read_request(&mut reader, DEFAULT_TIMEOUT).await?;

    // Heartbeats and queries are frequent; log them quietly.
    match &request {
        Request::Query { .. } | Request::Match { .. } | Request::AgentHeartbeat { .. } => {
            debug!(request = ?request, "received request")
        }
        _ => tracing::info!(request = ?request, "received request"),
    }

    let response = handle_request(request, ctx).await;
    protocol::write_response(&mut writer, &response, DEFAULT_TIMEOUT).await?;

    Ok(())
}

/// Dispatch one request.
async fn handle_request(request: Request, ctx: &ListenCtx) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::Hello { version: _ } => Response::Hello {
            version: PROTOCOL_VERSION.to_string(),
        },

        Request::Enqueue { request } => match ctx.ops.enqueue_session(request) {
            Ok(receipt) => Response::Receipt { receipt },
            Err(e) => Response::error(&e),
        },

        Request::Cancel { id } => match ctx.ops.cancel(&id) {
            Ok(receipt) => Response::Receipt { receipt },
            Err(e) => Response::error(&e),
        },

        Request::Destroy { id, forced } => match ctx.ops.destroy(&id, forced).await {
            Ok(receipt) => Response::Receipt { receipt },
            Err(e) => Response::error(&e),
        },

        Request::Restart { id } => match ctx.ops.restart(&id).await {
            Ok(receipt) => Response::Receipt { receipt },
            Err(e) => Response::error(&e),
        },

        Request::Interrupt { id, run_id } => match ctx.ops.interrupt(&id, &run_id).await {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        },

        Request::Exec {
            id,
            run_id,
            mode,
            code,
        } => match ctx.ops.exec(&id, &run_id, mode, &code).await {
            Ok(output) => Response::Exec { output },
            Err(e) => Response::error(&e),
        },

        Request::Query { id } => match ctx.ops.query_session(&id) {
            Ok(session) => Response::Session {
                session: Box::new(session),
            },
            Err(e) => Response::error(&e),
        },

        Request::Match {
            status,
            access_key,
            name_contains,
        } => {
            let sessions =
                ctx.ops
                    .match_sessions(status, access_key.as_deref(), name_contains.as_deref());
            Response::Sessions { sessions }
        }

        Request::ShowQueue { group } => match ctx.ops.show_queue(&group) {
            Ok(entries) => Response::Queue {
                entries: entries
                    .into_iter()
                    .map(|(entry, retries)| QueueEntry { entry, retries })
                    .collect(),
            },
            Err(e) => Response::error(&e),
        },

        Request::DrainAgent { agent_id, drain } => {
            match ctx.ops.drain_agent(&agent_id, drain) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::RecalcUsage => {
            let report = ctx.ops.recalc_usage();
            Response::Recalc {
                drift: report.drift,
            }
        }

        Request::RescanImages { group } => match ctx.ops.rescan_images(&group).await {
            Ok(synced) => Response::Rescan { synced },
            Err(e) => Response::error(&e),
        },

        Request::AgentJoin { agent } => match ctx.ops.agent_joined(agent) {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        },

        Request::AgentHeartbeat {
            agent_id,
            reported_slots,
            running_kernels,
        } => match ctx.ops.agent_heartbeat(agent_id, reported_slots, running_kernels) {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        },

        Request::KernelStarted { kernel_id } => match ctx.ops.kernel_started(&kernel_id) {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        },

        Request::KernelTerminated {
            kernel_id,
            exit_code,
        } => match ctx.ops.kernel_terminated(&kernel_id, exit_code) {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        },

        Request::KernelLost { kernel_id, reason } => {
            match ctx.ops.kernel_lost(&kernel_id, &reason) {
                Ok(()) => Response::Ok,
                Err(e) => Response::error(&e),
            }
        }

        Request::Status => {
            let (sessions, agents) = {
                let state = ctx.state.lock();
                (state.sessions.len(), state.agents.len())
            };
            Response::Status {
                status: DaemonStatus {
                    version: PROTOCOL_VERSION.to_string(),
                    uptime_ms: ctx.start_time.elapsed().as_millis() as u64,
                    sessions,
                    agents,
                    processed_seq: ctx.event_bus.processed_seq(),
                },
            }
        }

        Request::Shutdown => {
            ctx.shutdown.notify_one();
            Response::Ok
        }
    }
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
