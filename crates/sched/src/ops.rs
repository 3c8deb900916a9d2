// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Northbound operations: what the API layer calls.
//!
//! Validation happens here, before anything is enqueued: the resource group
//! must exist, every requested slot must be declared in its schema, the
//! owner's pending caps must hold, and the session name must be free among
//! the owner's live sessions. Write operations return a [`WriteReceipt`]
//! carrying the WAL sequence the caller may subscribe from.

use crate::accounting::Accounting;
use crate::context::{CoreContext, EventSink};
use crate::dispatch::Dispatcher;
use crate::error::SchedError;
use berth_core::{
    Agent, AgentId, Clock, ClusterMode, Event, Kernel, KernelId, KernelStatus, Owner,
    ResourceGroupId, ResourceSlots, SessionId, SessionKind, SessionResult, SessionSpec,
    SessionStatus, SlotName, StatusEntry,
};
use berth_rpc::{AgentClient, CallEnvelope, ExecMode, ExecOutput};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// An enqueue request as it crosses the wire: quantities are still human
/// strings, parsed against the group's slot schema during validation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnqueueRequest {
    pub name: String,
    pub owner: Owner,
    pub resource_group: ResourceGroupId,
    /// Per-kernel request, e.g. `{"cpu": "2", "mem": "4G"}`.
    pub slots: IndexMap<SlotName, String>,
    pub image: String,
    pub architecture: String,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    pub kind: SessionKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub environ: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_script: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lifetime_ms: Option<u64>,
}

/// Result of a write operation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WriteReceipt {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// WAL sequence of the write; event consumers may subscribe from here.
    pub seq: u64,
}

/// A session as query operations return it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionQuery {
    pub session: berth_core::Session,
    pub kernels: Vec<Kernel>,
    pub history: Vec<StatusEntry>,
}

/// Northbound operations facade.
pub struct Ops<C: AgentClient, K: Clock> {
    ctx: CoreContext<C, K>,
    dispatcher: Dispatcher<C, K>,
    accounting: Arc<Accounting>,
    /// Wakes the scheduler loop on enqueue/terminate.
    wake_tx: mpsc::Sender<()>,
}

impl<C: AgentClient, K: Clock + 'static> Ops<C, K> {
    pub fn new(
        ctx: CoreContext<C, K>,
        dispatcher: Dispatcher<C, K>,
        wake_tx: mpsc::Sender<()>,
    ) -> Self {
        let accounting = dispatcher.accounting();
        Self {
            ctx,
            dispatcher,
            accounting,
            wake_tx,
        }
    }

    fn wake_scheduler(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Validate and enqueue a new session (lands in PENDING).
    pub fn enqueue_session(&self, request: EnqueueRequest) -> Result<WriteReceipt, SchedError> {
        if request.cluster_size == 0 {
            return Err(SchedError::Validation("cluster_size must be at least 1".into()));
        }
        if request.name.is_empty() {
            return Err(SchedError::Validation("session name must not be empty".into()));
        }

        // Unknown group / unknown slot names / malformed quantities all fail
        // before anything is enqueued.
        let schema = self
            .ctx
            .config
            .slot_schema(&request.resource_group)
            .map_err(|e| SchedError::Validation(e.to_string()))?;
        let requested_slots: ResourceSlots = schema
            .parse_request(&request.slots)
            .map_err(|e| SchedError::Validation(e.to_string()))?;
        if requested_slots.is_empty() {
            return Err(SchedError::Validation("request has no resource slots".into()));
        }

        let policy = self
            .ctx
            .config
            .policy_for(&berth_core::Scope::Keypair(request.owner.access_key.clone()));
        if !policy.allowed_registries.is_empty()
            && !policy
                .allowed_registries
                .iter()
                .any(|r| request.image.starts_with(r.as_str()))
        {
            return Err(SchedError::Validation(format!(
                "registry of image '{}' is not allowed for this keypair",
                request.image
            )));
        }

        let (name_taken, pending_count) = self.ctx.with_state(|s| {
            (
                s.live_session_named(&request.owner.access_key, &request.name)
                    .is_some(),
                s.pending_sessions_of_keypair(&request.owner.access_key) as u32,
            )
        });
        if name_taken {
            return Err(SchedError::Conflict(format!(
                "session name '{}' is already in use",
                request.name
            )));
        }
        if let Some(max_pending) = policy.max_pending_sessions {
            if pending_count >= max_pending {
                return Err(SchedError::Capacity(format!(
                    "keypair already has {pending_count} pending sessions (max {max_pending})"
                )));
            }
        }

        let spec = SessionSpec {
            name: request.name,
            owner: request.owner,
            resource_group: request.resource_group,
            requested_slots,
            image: request.image,
            architecture: request.architecture,
            cluster_mode: request.cluster_mode,
            cluster_size: request.cluster_size,
            kind: request.kind,
            priority: request.priority,
            environ: request.environ,
            bootstrap_script: request.bootstrap_script,
            mounts: request.mounts,
            max_lifetime_ms: request.max_lifetime_ms,
        };

        let id = self.ctx.ids.session_id();
        let kernel_ids: Vec<KernelId> =
            (0..spec.cluster_size).map(|_| self.ctx.ids.kernel_id()).collect();
        let seq = self.ctx.sink.emit(Event::SessionEnqueued {
            id: id.clone(),
            spec,
            kernel_ids,
            at_ms: self.ctx.clock.epoch_ms(),
        })?;

        info!(session = %id.short(8), "session enqueued");
        self.wake_scheduler();
        Ok(WriteReceipt {
            session_id: id,
            status: SessionStatus::Pending,
            seq,
        })
    }

    /// Cancel a pending session. Idempotent: cancelling an already-terminal
    /// session reports its terminal status as success.
    pub fn cancel(&self, id: &str) -> Result<WriteReceipt, SchedError> {
        let (session_id, status) = self.resolve(id)?;
        if status.is_terminal() {
            return Ok(WriteReceipt {
                session_id,
                status,
                seq: 0,
            });
        }
        if status != SessionStatus::Pending {
            return Err(SchedError::Conflict(format!(
                "session is {status}; use destroy for sessions past the queue"
            )));
        }
        let at_ms = self.ctx.clock.epoch_ms();
        let (_, event) = self.ctx.with_state_mut(|s| {
            s.transit(
                &session_id,
                SessionStatus::Pending,
                SessionStatus::Cancelled,
                Some("cancelled by user".into()),
                None,
                at_ms,
            )
        })?;
        let seq = match event {
            Some(event) => self.ctx.sink.emit(event)?,
            None => 0,
        };
        Ok(WriteReceipt {
            session_id,
            status: SessionStatus::Cancelled,
            seq,
        })
    }

    /// Destroy a session wherever it is in its lifecycle. Idempotent.
    pub async fn destroy(&self, id: &str, forced: bool) -> Result<WriteReceipt, SchedError> {
        let (session_id, _) = self.resolve(id)?;
        let reason = if forced {
            "force-terminated by operator"
        } else {
            "destroyed by user"
        };
        let status = self
            .dispatcher
            .destroy_session(&session_id, Some(reason.into()))
            .await?;
        self.wake_scheduler();
        let seq = self.ctx.with_state(|s| {
            s.history_of(&session_id).last().map(|e| e.seq).unwrap_or(0)
        });
        Ok(WriteReceipt {
            session_id,
            status,
            seq,
        })
    }

    /// Restart a running session in place.
    pub async fn restart(&self, id: &str) -> Result<WriteReceipt, SchedError> {
        let (session_id, status) = self.resolve(id)?;
        if status != SessionStatus::Running {
            return Err(SchedError::Conflict(format!(
                "session is {status}; only running sessions restart"
            )));
        }
        self.dispatcher.restart_session(&session_id).await?;
        let seq = self.ctx.with_state(|s| {
            s.history_of(&session_id).last().map(|e| e.seq).unwrap_or(0)
        });
        Ok(WriteReceipt {
            session_id,
            status: SessionStatus::Running,
            seq,
        })
    }

    /// Interrupt the current run on the session's main kernel.
    pub async fn interrupt(&self, id: &str, _run_id: &str) -> Result<(), SchedError> {
        let (session_id, kernel, agent_id) = self.main_kernel(id)?;
        let envelope = self.envelope(&session_id, kernel.attempt_seq);
        self.ctx
            .pool
            .interrupt(&agent_id, &kernel.id, &envelope, self.ctx.config.rpc.exec_timeout)
            .await
            .map_err(SchedError::from_rpc)?;
        Ok(())
    }

    /// Run code on the session's main kernel.
    pub async fn exec(
        &self,
        id: &str,
        run_id: &str,
        mode: ExecMode,
        code: &str,
    ) -> Result<ExecOutput, SchedError> {
        let (session_id, kernel, agent_id) = self.main_kernel(id)?;
        let envelope = self.envelope(&session_id, kernel.attempt_seq);
        let output = self
            .ctx
            .pool
            .exec(
                &agent_id,
                &kernel.id,
                run_id,
                mode,
                code,
                &envelope,
                self.ctx.config.rpc.exec_timeout,
            )
            .await
            .map_err(SchedError::from_rpc)?;
        self.ctx.sink.emit(Event::SessionTouched {
            id: session_id,
            at_ms: self.ctx.clock.epoch_ms(),
        })?;
        Ok(output)
    }

    /// Full view of one session.
    pub fn query_session(&self, id: &str) -> Result<SessionQuery, SchedError> {
        self.ctx.with_state(|s| {
            let session = s
                .get_session(id)
                .cloned()
                .ok_or_else(|| SchedError::NotFound(format!("session {id}")))?;
            let kernels = s.kernels_of(&session).into_iter().cloned().collect();
            let history = s.history_of(&session.id).to_vec();
            Ok(SessionQuery {
                session,
                kernels,
                history,
            })
        })
    }

    /// Sessions matching a filter (all when empty).
    pub fn match_sessions(
        &self,
        status: Option<SessionStatus>,
        access_key: Option<&str>,
        name_contains: Option<&str>,
    ) -> Vec<SessionQuery> {
        self.ctx.with_state(|s| {
            let mut out: Vec<SessionQuery> = s
                .sessions
                .values()
                .filter(|sess| status.is_none_or(|wanted| sess.status == wanted))
                .filter(|sess| {
                    access_key.is_none_or(|ak| sess.spec.owner.access_key == ak)
                })
                .filter(|sess| {
                    name_contains.is_none_or(|needle| sess.spec.name.contains(needle))
                })
                .map(|sess| SessionQuery {
                    session: sess.clone(),
                    kernels: s.kernels_of(sess).into_iter().cloned().collect(),
                    history: s.history_of(&sess.id).to_vec(),
                })
                .collect();
            out.sort_by_key(|q| (q.session.enqueued_at_ms, q.session.id.clone()));
            out
        })
    }

    /// The pending queue of a resource group, oldest first, with HoL state.
    pub fn show_queue(&self, group: &ResourceGroupId) -> Result<Vec<(SessionQuery, u32)>, SchedError> {
        if !self.ctx.config.resource_groups.contains_key(group) {
            return Err(SchedError::NotFound(format!("resource group {group}")));
        }
        Ok(self.ctx.with_state(|s| {
            let retries = s.group_state(group).retries;
            s.pending_in_group(group)
                .into_iter()
                .map(|sess| {
                    let entry = SessionQuery {
                        session: sess.clone(),
                        kernels: s.kernels_of(sess).into_iter().cloned().collect(),
                        history: s.history_of(&sess.id).to_vec(),
                    };
                    let r = retries.get(&sess.id).copied().unwrap_or(0);
                    (entry, r)
                })
                .collect()
        }))
    }

    /// Mark an agent as draining (or undrain it).
    pub fn drain_agent(&self, agent_id: &str, draining: bool) -> Result<(), SchedError> {
        let agent_id = self.ctx.with_state(|s| {
            s.get_agent(agent_id)
                .map(|a| a.id.clone())
                .ok_or_else(|| SchedError::NotFound(format!("agent {agent_id}")))
        })?;
        self.ctx.sink.emit(Event::AgentDrainSet { agent_id, draining })?;
        Ok(())
    }

    /// Validate running totals against the accounting journal.
    pub fn recalc_usage(&self) -> crate::accounting::RecalcReport {
        self.accounting.recalculate()
    }

    /// Ask every alive agent of a group to re-sync its image catalog.
    pub async fn rescan_images(&self, group: &ResourceGroupId) -> Result<u32, SchedError> {
        if !self.ctx.config.resource_groups.contains_key(group) {
            return Err(SchedError::NotFound(format!("resource group {group}")));
        }
        let agents: Vec<AgentId> = self.ctx.with_state(|s| {
            s.agents_in_group(group)
                .into_iter()
                .filter(|a| a.schedulable())
                .map(|a| a.id.clone())
                .collect()
        });
        let mut synced = 0;
        for agent_id in agents {
            let envelope = CallEnvelope::new(self.ctx.ids.request_id(), 0, 0);
            if self
                .ctx
                .pool
                .sync_images(&agent_id, &[], &envelope, self.ctx.config.rpc.create_timeout)
                .await
                .is_ok()
            {
                synced += 1;
            }
        }
        Ok(synced)
    }

    /// Worker announcement: first heartbeat of an agent.
    pub fn agent_joined(&self, agent: Agent) -> Result<(), SchedError> {
        self.ctx.pool.set_budget(&agent.id, agent.concurrency_budget);
        self.ctx.sink.emit(Event::AgentJoined { agent })?;
        self.wake_scheduler();
        Ok(())
    }

    /// Worker heartbeat.
    pub fn agent_heartbeat(
        &self,
        agent_id: AgentId,
        reported_slots: ResourceSlots,
        running_kernels: Vec<KernelId>,
    ) -> Result<(), SchedError> {
        self.ctx.sink.emit(Event::AgentHeartbeat {
            agent_id,
            reported_slots,
            running_kernels,
            at_ms: self.ctx.clock.epoch_ms(),
        })?;
        self.wake_scheduler();
        Ok(())
    }

    /// Worker report: a kernel's container is up. Usually redundant with
    /// the create ack, so this is idempotent.
    pub fn kernel_started(&self, kernel_id: &KernelId) -> Result<(), SchedError> {
        let status = self
            .ctx
            .with_state(|s| s.kernels.get(kernel_id).map(|k| k.status));
        match status {
            None => Err(SchedError::NotFound(format!("kernel {kernel_id}"))),
            Some(KernelStatus::Running) => Ok(()),
            Some(status) if status.is_terminal() => Ok(()),
            Some(_) => {
                self.ctx.sink.emit(Event::KernelStatusChanged {
                    kernel_id: kernel_id.clone(),
                    status: KernelStatus::Running,
                    reason: None,
                })?;
                Ok(())
            }
        }
    }

    /// Worker report: a kernel exited.
    pub fn kernel_terminated(&self, kernel_id: &KernelId, exit_code: i32) -> Result<(), SchedError> {
        let Some((session, kernel, agent_id)) = self.ctx.with_state(|s| {
            let kernel = s.kernels.get(kernel_id)?.clone();
            let session = s.sessions.get(&kernel.session_id)?.clone();
            let agent_id = kernel.agent_id.clone()?;
            Some((session, kernel, agent_id))
        }) else {
            return Err(SchedError::NotFound(format!("kernel {kernel_id}")));
        };
        if kernel.status.is_terminal() {
            return Ok(());
        }

        self.ctx.sink.emit(Event::KernelStatusChanged {
            kernel_id: kernel_id.clone(),
            status: KernelStatus::Terminated,
            reason: Some(format!("exit code {exit_code}")),
        })?;
        let token = self
            .ctx
            .with_state(|s| s.group_state(&session.spec.resource_group).max_token);
        self.accounting.release_kernel(&session, &kernel, &agent_id, token)?;

        // When the last kernel goes, the session follows it down.
        let all_terminal = self.ctx.with_state(|s| {
            s.sessions
                .get(&session.id)
                .map(|sess| {
                    s.kernels_of(sess).iter().all(|k| k.status.is_terminal())
                })
                .unwrap_or(false)
        });
        if all_terminal && !session.status.is_terminal() {
            let result = if exit_code == 0 {
                SessionResult::Success
            } else {
                SessionResult::Failure
            };
            let at_ms = self.ctx.clock.epoch_ms();
            let current = self
                .ctx
                .with_state(|s| s.sessions.get(&session.id).map(|sess| sess.status))
                .unwrap_or(session.status);
            if !current.is_terminal() {
                let (_, event) = self.ctx.with_state_mut(|s| {
                    s.transit(
                        &session.id,
                        current,
                        SessionStatus::Terminating,
                        Some("all kernels exited".into()),
                        None,
                        at_ms,
                    )
                })?;
                if let Some(event) = event {
                    self.ctx.sink.emit(event)?;
                }
                let (_, event) = self.ctx.with_state_mut(|s| {
                    s.transit(
                        &session.id,
                        SessionStatus::Terminating,
                        SessionStatus::Terminated,
                        None,
                        Some(result),
                        at_ms,
                    )
                })?;
                if let Some(event) = event {
                    self.ctx.sink.emit(event)?;
                }
            }
            self.wake_scheduler();
        }
        Ok(())
    }

    /// Worker report: a kernel vanished.
    pub fn kernel_lost(&self, kernel_id: &KernelId, reason: &str) -> Result<(), SchedError> {
        let known = self
            .ctx
            .with_state(|s| s.kernels.get(kernel_id).map(|k| k.status));
        match known {
            None => Err(SchedError::NotFound(format!("kernel {kernel_id}"))),
            Some(status) if status.is_terminal() => Ok(()),
            Some(_) => {
                self.ctx.sink.emit(Event::KernelStatusChanged {
                    kernel_id: kernel_id.clone(),
                    status: KernelStatus::Lost,
                    reason: Some(reason.to_string()),
                })?;
                Ok(())
            }
        }
    }

    fn resolve(&self, id: &str) -> Result<(SessionId, SessionStatus), SchedError> {
        self.ctx.with_state(|s| {
            s.get_session(id)
                .map(|sess| (sess.id.clone(), sess.status))
                .ok_or_else(|| SchedError::NotFound(format!("session {id}")))
        })
    }

    fn main_kernel(&self, id: &str) -> Result<(SessionId, Kernel, AgentId), SchedError> {
        self.ctx.with_state(|s| {
            let session = s
                .get_session(id)
                .ok_or_else(|| SchedError::NotFound(format!("session {id}")))?;
            if !matches!(
                session.status,
                SessionStatus::Running | SessionStatus::RunningDegraded
            ) {
                return Err(SchedError::Conflict(format!(
                    "session is {}; not running",
                    session.status
                )));
            }
            let kernel = s
                .kernels_of(session)
                .into_iter()
                .find(|k| k.role == berth_core::KernelRole::Main)
                .cloned()
                .ok_or_else(|| {
                    SchedError::Invariant(format!("session {} has no main kernel", session.id))
                })?;
            let agent_id = kernel.agent_id.clone().ok_or_else(|| {
                SchedError::Invariant(format!("running kernel {} has no agent", kernel.id))
            })?;
            Ok((session.id.clone(), kernel, agent_id))
        })
    }

    fn envelope(&self, _session: &SessionId, attempt_seq: u32) -> CallEnvelope {
        CallEnvelope::new(self.ctx.ids.request_id(), attempt_seq, 0)
    }
}

#[cfg(test)]
#[path = "ops_tests.rs"]
mod tests;
