// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatch coordinator: drives scheduled sessions onto their agents.
//!
//! Creates are at-most-once per `(kernel_id, attempt_seq)`; the attempt is
//! made durable (WAL) before the RPC leaves, so a leader that crashes
//! mid-dispatch can never silently double-create. Creating the N kernels of
//! a cluster session is atomic from the session's perspective: any failure
//! destroys what was already created, releases accounting, and lands the
//! session in ERROR. Same-agent creates are issued strictly in cluster-index
//! order; different agents proceed in parallel.

use crate::accounting::Accounting;
use crate::context::{CoreContext, EventSink};
use crate::error::SchedError;
use berth_core::{
    AgentId, Clock, Event, Kernel, KernelStatus, SessionId, SessionResult, SessionStatus,
};
use berth_rpc::{AgentClient, CallEnvelope, ImageSync, KernelLaunchSpec, RpcError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Drives sessions from SCHEDULED to RUNNING and back down to TERMINATED.
pub struct Dispatcher<C: AgentClient, K: Clock> {
    ctx: CoreContext<C, K>,
    accounting: Arc<Accounting>,
    cancel: CancellationToken,
}

impl<C: AgentClient, K: Clock + 'static> Clone for Dispatcher<C, K> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            accounting: Arc::clone(&self.accounting),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: AgentClient, K: Clock + 'static> Dispatcher<C, K> {
    pub fn new(ctx: CoreContext<C, K>, cancel: CancellationToken) -> Self {
        let accounting = Arc::new(Accounting::new(
            Arc::clone(&ctx.state),
            Arc::clone(&ctx.sink),
            Arc::clone(&ctx.config),
        ));
        Self {
            ctx,
            accounting,
            cancel,
        }
    }

    pub fn accounting(&self) -> Arc<Accounting> {
        Arc::clone(&self.accounting)
    }

    fn envelope(&self, attempt_seq: u32, token: u64) -> CallEnvelope {
        CallEnvelope::new(self.ctx.ids.request_id(), attempt_seq, token)
    }

    /// CAS transit + durable event, in one move.
    fn transit(
        &self,
        id: &SessionId,
        expect: SessionStatus,
        next: SessionStatus,
        reason: Option<String>,
        result: Option<SessionResult>,
    ) -> Result<(), SchedError> {
        let at_ms = self.ctx.clock.epoch_ms();
        let event = self
            .ctx
            .with_state_mut(|s| s.transit(id, expect, next, reason, result, at_ms))
            .map(|(_, event)| event)?;
        if let Some(event) = event {
            self.ctx.sink.emit(event)?;
        }
        Ok(())
    }

    fn load_session(&self, id: &SessionId) -> Result<(berth_core::Session, Vec<Kernel>), SchedError> {
        self.ctx.with_state(|s| {
            let session = s
                .sessions
                .get(id)
                .cloned()
                .ok_or_else(|| SchedError::NotFound(format!("session {id}")))?;
            let kernels = s.kernels_of(&session).into_iter().cloned().collect();
            Ok((session, kernels))
        })
    }

    /// Kernels grouped by assigned agent, cluster-index order within each.
    fn by_agent(kernels: &[Kernel]) -> BTreeMap<AgentId, Vec<Kernel>> {
        let mut groups: BTreeMap<AgentId, Vec<Kernel>> = BTreeMap::new();
        for kernel in kernels {
            if let Some(agent_id) = &kernel.agent_id {
                groups.entry(agent_id.clone()).or_default().push(kernel.clone());
            }
        }
        for list in groups.values_mut() {
            list.sort_by_key(|k| k.cluster_idx);
        }
        groups
    }

    /// Drive one scheduled session to RUNNING (or ERROR).
    pub async fn run_session(&self, id: &SessionId, token: u64) -> Result<(), SchedError> {
        let (session, kernels) = self.load_session(id)?;
        if session.status != SessionStatus::Scheduled {
            // Another dispatcher (or a reconciler) got here first.
            info!(session = %id.short(8), status = %session.status, "skipping dispatch");
            return Ok(());
        }

        self.transit(id, SessionStatus::Scheduled, SessionStatus::Preparing, None, None)?;

        match self.stage_and_create(&session, &kernels, token).await {
            Ok(()) => {
                self.transit(id, SessionStatus::Creating, SessionStatus::Running, None, None)?;
                info!(session = %id.short(8), kernels = kernels.len(), "session running");
                Ok(())
            }
            Err(failure) => {
                warn!(session = %id.short(8), error = %failure, "dispatch failed, rolling back");
                self.teardown_kernels(id, token, Some("dispatch rollback".into())).await?;
                let (_, event) = self.ctx.with_state_mut(|s| {
                    let current = s
                        .sessions
                        .get(id)
                        .map(|sess| sess.status)
                        .unwrap_or(SessionStatus::Error);
                    s.transit(
                        id,
                        current,
                        SessionStatus::Error,
                        Some(failure.to_string()),
                        Some(SessionResult::Failure),
                        self.ctx.clock.epoch_ms(),
                    )
                })?;
                if let Some(event) = event {
                    self.ctx.sink.emit(event)?;
                }
                Err(failure)
            }
        }
    }

    /// Image staging + kernel creation, with the PULLING detour when needed.
    async fn stage_and_create(
        &self,
        session: &berth_core::Session,
        kernels: &[Kernel],
        token: u64,
    ) -> Result<(), SchedError> {
        let id = &session.id;
        let groups = Self::by_agent(kernels);
        if groups.is_empty() {
            return Err(SchedError::Invariant(format!(
                "session {id} reached dispatch with no assigned kernels"
            )));
        }
        let images = vec![session.spec.image.clone()];
        let rpc = &self.ctx.config.rpc;

        // Stage images on every involved agent.
        let mut pulling: Vec<AgentId> = Vec::new();
        for agent_id in groups.keys() {
            let envelope = self.envelope(0, token);
            let sync = self
                .guarded(self.ctx.pool.sync_images(agent_id, &images, &envelope, rpc.create_timeout))
                .await
                .map_err(SchedError::from_rpc)?;
            if sync == ImageSync::Pulling {
                pulling.push(agent_id.clone());
            }
        }

        if pulling.is_empty() {
            self.transit(id, SessionStatus::Preparing, SessionStatus::Creating, None, None)?;
        } else {
            self.transit(id, SessionStatus::Preparing, SessionStatus::Pulling, None, None)?;
            for agent_id in &pulling {
                let envelope = self.envelope(0, token);
                self.guarded(self.ctx.pool.await_images(
                    agent_id,
                    &images,
                    &envelope,
                    rpc.image_pull_timeout,
                ))
                .await
                .map_err(SchedError::from_rpc)?;
            }
            self.transit(id, SessionStatus::Pulling, SessionStatus::Prepared, None, None)?;
            self.transit(id, SessionStatus::Prepared, SessionStatus::Creating, None, None)?;
        }

        // Create kernels: in order per agent, in parallel across agents.
        let mut tasks: JoinSet<Result<(), SchedError>> = JoinSet::new();
        for (agent_id, agent_kernels) in groups {
            let this = self.clone();
            let session = session.clone();
            tasks.spawn(async move {
                for kernel in agent_kernels {
                    this.create_one(&session, &kernel, &agent_id, token).await?;
                }
                Ok(())
            });
        }

        let mut failure: Option<SchedError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failure = Some(failure.take().unwrap_or(e)),
                Err(e) => {
                    failure = Some(failure.take().unwrap_or(SchedError::Transient(format!(
                        "create task aborted: {e}"
                    ))));
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Create one kernel with at-most-once attempts and a single internal
    /// retry (with cooldown) for retriable failures.
    async fn create_one(
        &self,
        session: &berth_core::Session,
        kernel: &Kernel,
        agent_id: &AgentId,
        token: u64,
    ) -> Result<(), SchedError> {
        let spec = KernelLaunchSpec {
            kernel_id: kernel.id.clone(),
            session_id: session.id.clone(),
            image: kernel.image.clone(),
            architecture: kernel.architecture.clone(),
            slots: kernel.allocated_slots.clone(),
            cluster_role: kernel.role.to_string(),
            cluster_idx: kernel.cluster_idx,
            environ: session.spec.environ.clone(),
            bootstrap_script: session.spec.bootstrap_script.clone(),
            mounts: session.spec.mounts.clone(),
        };
        self.ctx.sink.emit(Event::KernelStatusChanged {
            kernel_id: kernel.id.clone(),
            status: KernelStatus::Creating,
            reason: None,
        })?;

        let mut last_error = SchedError::Transient("no attempt made".into());
        for round in 0..2 {
            if self.cancel.is_cancelled() {
                return Err(SchedError::Transient("dispatch cancelled".into()));
            }

            // Durable attempt number before the RPC leaves: this is what
            // makes the create at-most-once across leader changes.
            let attempt_seq = self
                .ctx
                .with_state(|s| s.get_kernel(kernel.id.as_str()).map(|k| k.attempt_seq))
                .unwrap_or(kernel.attempt_seq)
                + 1;
            self.ctx.sink.emit(Event::KernelDispatchStarted {
                kernel_id: kernel.id.clone(),
                attempt_seq,
            })?;

            let envelope = self.envelope(attempt_seq, token);
            let result = self
                .guarded(self.ctx.pool.create_kernel(
                    agent_id,
                    &spec,
                    &envelope,
                    self.ctx.config.rpc.create_timeout,
                ))
                .await;

            match result {
                Ok(handle) => {
                    self.ctx.sink.emit(Event::KernelCreated {
                        kernel_id: kernel.id.clone(),
                        container_id: handle.container_id,
                        service_ports: handle.service_ports,
                    })?;
                    self.ctx.sink.emit(Event::KernelStatusChanged {
                        kernel_id: kernel.id.clone(),
                        status: KernelStatus::Running,
                        reason: None,
                    })?;
                    return Ok(());
                }
                Err(e) if e.is_retriable() && round == 0 => {
                    warn!(
                        kernel = %kernel.id.short(8),
                        agent = %agent_id,
                        error = %e,
                        "create failed, retrying once after cooldown"
                    );
                    last_error = SchedError::from_rpc(e);
                    tokio::time::sleep(self.ctx.config.scheduler.retry_cooldown).await;
                }
                Err(e) => {
                    last_error = SchedError::from_rpc(e);
                    break;
                }
            }
        }

        // First terminal status for this kernel: the release rides with it.
        self.ctx.sink.emit(Event::KernelStatusChanged {
            kernel_id: kernel.id.clone(),
            status: KernelStatus::Error,
            reason: Some(last_error.to_string()),
        })?;
        self.accounting.release_kernel(session, kernel, agent_id, token)?;
        Err(last_error)
    }

    /// Destroy every non-terminal kernel of a session and release its
    /// accounting. Safe to call repeatedly: kernels already terminal are
    /// skipped, and skipped kernels were already released.
    pub async fn teardown_kernels(
        &self,
        id: &SessionId,
        token: u64,
        reason: Option<String>,
    ) -> Result<(), SchedError> {
        let (session, kernels) = self.load_session(id)?;

        for kernel in kernels {
            if kernel.status.is_terminal() {
                continue;
            }
            let Some(agent_id) = kernel.agent_id.clone() else {
                // Never placed: nothing to destroy, nothing reserved.
                self.ctx.sink.emit(Event::KernelStatusChanged {
                    kernel_id: kernel.id.clone(),
                    status: KernelStatus::Terminated,
                    reason: reason.clone(),
                })?;
                continue;
            };

            if kernel.container_id.is_some() || kernel.status == KernelStatus::Creating {
                let envelope = self.envelope(kernel.attempt_seq, token);
                let destroy = self
                    .ctx
                    .pool
                    .destroy_kernel(
                        &agent_id,
                        &kernel.id,
                        &envelope,
                        self.ctx.config.rpc.destroy_timeout,
                    )
                    .await;
                if let Err(e) = destroy {
                    // Best-effort: the orphan sweep will catch leftovers.
                    warn!(
                        kernel = %kernel.id.short(8),
                        agent = %agent_id,
                        error = %e,
                        "destroy failed, leaving for the orphan sweep"
                    );
                }
            }

            self.ctx.sink.emit(Event::KernelStatusChanged {
                kernel_id: kernel.id.clone(),
                status: KernelStatus::Terminated,
                reason: reason.clone(),
            })?;
            self.accounting.release_kernel(&session, &kernel, &agent_id, token)?;
        }
        Ok(())
    }

    /// User-facing destroy. Idempotent: terminal sessions are a no-op
    /// success; pending sessions are cancelled without touching agents.
    pub async fn destroy_session(
        &self,
        id: &SessionId,
        reason: Option<String>,
    ) -> Result<SessionStatus, SchedError> {
        let (session, _) = self.load_session(id)?;
        let token = self.current_token(&session);

        match session.status {
            status if status.is_terminal() => Ok(status),
            SessionStatus::Pending => {
                self.transit(id, SessionStatus::Pending, SessionStatus::Cancelled, reason, None)?;
                Ok(SessionStatus::Cancelled)
            }
            status => {
                self.transit(id, status, SessionStatus::Terminating, reason.clone(), None)?;
                self.teardown_kernels(id, token, reason).await?;
                let result = if status == SessionStatus::Error {
                    SessionResult::Failure
                } else {
                    SessionResult::Success
                };
                self.transit(
                    id,
                    SessionStatus::Terminating,
                    SessionStatus::Terminated,
                    None,
                    Some(result),
                )?;
                Ok(SessionStatus::Terminated)
            }
        }
    }

    /// User-facing restart: RUNNING -> RESTARTING -> RUNNING.
    pub async fn restart_session(&self, id: &SessionId) -> Result<(), SchedError> {
        let (session, kernels) = self.load_session(id)?;
        let token = self.current_token(&session);
        self.transit(id, SessionStatus::Running, SessionStatus::Restarting, None, None)?;

        for kernel in &kernels {
            let Some(agent_id) = &kernel.agent_id else {
                continue;
            };
            let envelope = self.envelope(kernel.attempt_seq, token);
            let restart = self
                .guarded(self.ctx.pool.restart_kernel(
                    agent_id,
                    &kernel.id,
                    &envelope,
                    self.ctx.config.rpc.create_timeout,
                ))
                .await;
            if let Err(e) = restart {
                let failure = SchedError::from_rpc(e);
                self.teardown_kernels(id, token, Some("restart failed".into())).await?;
                self.transit(
                    id,
                    SessionStatus::Restarting,
                    SessionStatus::Error,
                    Some(failure.to_string()),
                    Some(SessionResult::Failure),
                )?;
                return Err(failure);
            }
        }

        self.transit(id, SessionStatus::Restarting, SessionStatus::Running, None, None)?;
        Ok(())
    }

    /// Highest fenced token seen for the session's group; good enough for
    /// non-leader writes (destroys, reconciliation) which the fence accepts
    /// at equal tokens.
    fn current_token(&self, session: &berth_core::Session) -> u64 {
        self.ctx
            .with_state(|s| s.group_state(&session.spec.resource_group).max_token)
    }

    /// Run an RPC future, aborting early on cancellation.
    async fn guarded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RpcError::Unreachable("dispatch cancelled".into())),
            result = fut => result,
        }
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
