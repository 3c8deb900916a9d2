// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifecycle reconciler ("check-and-transit").
//!
//! Periodically compares every non-terminal session's time-in-state against
//! the configured per-state deadlines, sweeps sessions stranded by a crashed
//! leader, enforces idle and lifetime limits, declares silent agents lost,
//! and resolves orphans in both directions: a container an agent reports
//! that the store doesn't know is destroyed; a kernel the store believes is
//! running that its agent doesn't report is marked lost.

use crate::context::{CoreContext, EventSink};
use crate::dispatch::Dispatcher;
use crate::error::SchedError;
use crate::lease::LeaderLease;
use berth_core::{
    AgentId, AgentStatus, Clock, Event, KernelId, KernelStatus, ResourceGroupId, SessionId,
    SessionStatus,
};
use berth_rpc::{AgentClient, CallEnvelope};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions errored for exceeding a state deadline.
    pub stuck: u32,
    /// Sessions terminated for idle timeout or max lifetime.
    pub expired: u32,
    /// Agents newly declared lost.
    pub lost_agents: u32,
    /// Sessions degraded (subset of kernels lost).
    pub degraded: u32,
    /// Sessions errored because every kernel was lost.
    pub dead: u32,
    /// Orphan containers destroyed on agents.
    pub orphans_destroyed: u32,
    /// Store kernels marked lost because their agent stopped reporting them.
    pub kernels_lost: u32,
    /// Degraded sessions whose kernels all came back.
    pub recovered: u32,
}

/// The reconciler task.
pub struct Reconciler<C: AgentClient, K: Clock> {
    ctx: CoreContext<C, K>,
    dispatcher: Dispatcher<C, K>,
    lease: Arc<dyn LeaderLease>,
    cancel: CancellationToken,
}

impl<C: AgentClient, K: Clock + 'static> Reconciler<C, K> {
    pub fn new(
        ctx: CoreContext<C, K>,
        dispatcher: Dispatcher<C, K>,
        lease: Arc<dyn LeaderLease>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            lease,
            cancel,
        }
    }

    /// Run until cancelled, one pass per configured interval.
    pub async fn run(self) {
        let interval = self.ctx.config.reconciler.interval;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("reconciler stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let groups: Vec<ResourceGroupId> =
                self.ctx.config.resource_groups.keys().cloned().collect();
            for group in groups {
                if let Err(e) = self.run_once(&group).await {
                    warn!(group = %group, error = %e, "reconciliation pass failed");
                }
            }
        }
    }

    /// One reconciliation pass over one resource group.
    ///
    /// Requires the group's leader lease; a non-leader replica skips the
    /// pass entirely.
    pub async fn run_once(&self, group: &ResourceGroupId) -> Result<ReconcileReport, SchedError> {
        let ttl = self.ctx.config.scheduler.leader_lock_ttl;
        let Some(lease) = self.lease.acquire(group, ttl)? else {
            return Ok(ReconcileReport::default());
        };
        let token = lease.token;

        let mut report = ReconcileReport::default();
        self.sweep_lost_agents(group, &mut report)?;
        self.sweep_orphans(group, token, &mut report).await?;
        self.sweep_kernel_health(group, token, &mut report).await?;
        self.sweep_deadlines(group, token, &mut report).await?;
        self.sweep_expiry(group, &mut report).await?;

        self.lease.release(lease)?;
        if report != ReconcileReport::default() {
            info!(group = %group, ?report, "reconciliation acted");
        }
        Ok(report)
    }

    /// Agents silent beyond the lost threshold.
    fn sweep_lost_agents(
        &self,
        group: &ResourceGroupId,
        report: &mut ReconcileReport,
    ) -> Result<(), SchedError> {
        let now_ms = self.ctx.clock.epoch_ms();
        let lost_after = self.ctx.config.reconciler.lost_agent_after.as_millis() as u64;

        let newly_lost: Vec<AgentId> = self.ctx.with_state(|s| {
            s.agents_in_group(group)
                .into_iter()
                .filter(|a| {
                    a.status == AgentStatus::Alive
                        && a.last_heartbeat_ms + lost_after < now_ms
                })
                .map(|a| a.id.clone())
                .collect()
        });

        for agent_id in newly_lost {
            warn!(agent = %agent_id, "agent heartbeats stopped, declaring lost");
            self.ctx.sink.emit(Event::AgentStatusChanged {
                agent_id: agent_id.clone(),
                status: AgentStatus::Lost,
                reason: Some("heartbeat timeout".into()),
            })?;
            report.lost_agents += 1;

            // Kernels on a lost agent are lost with it.
            let kernel_ids: Vec<KernelId> = self.ctx.with_state(|s| {
                s.kernels
                    .values()
                    .filter(|k| k.agent_id.as_ref() == Some(&agent_id) && !k.status.is_terminal())
                    .map(|k| k.id.clone())
                    .collect()
            });
            for kernel_id in kernel_ids {
                self.ctx.sink.emit(Event::KernelStatusChanged {
                    kernel_id,
                    status: KernelStatus::Lost,
                    reason: Some(format!("agent {agent_id} lost")),
                })?;
            }
        }
        Ok(())
    }

    /// Both orphan directions, driven by the latest heartbeats.
    async fn sweep_orphans(
        &self,
        group: &ResourceGroupId,
        token: u64,
        report: &mut ReconcileReport,
    ) -> Result<(), SchedError> {
        let heartbeats: Vec<(AgentId, Vec<KernelId>, u64)> = self.ctx.with_state(|s| {
            s.agents_in_group(group)
                .into_iter()
                .filter_map(|a| {
                    s.heartbeats
                        .get(&a.id)
                        .map(|hb| (a.id.clone(), hb.running_kernels.clone(), hb.at_ms))
                })
                .collect()
        });

        for (agent_id, reported, _at_ms) in &heartbeats {
            let reported_set: HashSet<&KernelId> = reported.iter().collect();

            // Containers the agent runs that the store does not: destroy.
            let orphans: Vec<KernelId> = self.ctx.with_state(|s| {
                reported
                    .iter()
                    .filter(|kid| match s.kernels.get(kid.as_str()) {
                        None => true,
                        Some(k) => {
                            k.status.is_terminal()
                                || s.sessions
                                    .get(&k.session_id)
                                    .is_none_or(|sess| sess.is_terminal())
                        }
                    })
                    .cloned()
                    .collect()
            });
            for kernel_id in orphans {
                warn!(agent = %agent_id, kernel = %kernel_id.short(8), "destroying orphan container");
                let envelope =
                    CallEnvelope::new(self.ctx.ids.request_id(), u32::MAX, token);
                let destroy = self
                    .ctx
                    .pool
                    .destroy_kernel(
                        agent_id,
                        &kernel_id,
                        &envelope,
                        self.ctx.config.rpc.destroy_timeout,
                    )
                    .await;
                if destroy.is_ok() {
                    report.orphans_destroyed += 1;
                }
            }

            // Store kernels this agent should be running but doesn't report.
            let missing: Vec<KernelId> = self.ctx.with_state(|s| {
                s.kernels
                    .values()
                    .filter(|k| {
                        k.agent_id.as_ref() == Some(agent_id)
                            && k.status == KernelStatus::Running
                            && !reported_set.contains(&k.id)
                    })
                    .map(|k| k.id.clone())
                    .collect()
            });
            for kernel_id in missing {
                warn!(agent = %agent_id, kernel = %kernel_id.short(8), "agent no longer reports kernel, marking lost");
                self.ctx.sink.emit(Event::KernelStatusChanged {
                    kernel_id,
                    status: KernelStatus::Lost,
                    reason: Some("not reported by agent".into()),
                })?;
                report.kernels_lost += 1;
            }

            // Lost kernels the agent reports again have come back.
            let returned: Vec<KernelId> = self.ctx.with_state(|s| {
                s.kernels
                    .values()
                    .filter(|k| {
                        k.agent_id.as_ref() == Some(agent_id)
                            && k.status == KernelStatus::Lost
                            && reported_set.contains(&k.id)
                    })
                    .map(|k| k.id.clone())
                    .collect()
            });
            for kernel_id in returned {
                self.ctx.sink.emit(Event::KernelStatusChanged {
                    kernel_id,
                    status: KernelStatus::Running,
                    reason: Some("reported again by agent".into()),
                })?;
            }
        }
        Ok(())
    }

    /// Session-level consequences of kernel loss and recovery.
    async fn sweep_kernel_health(
        &self,
        group: &ResourceGroupId,
        token: u64,
        report: &mut ReconcileReport,
    ) -> Result<(), SchedError> {
        #[derive(PartialEq)]
        enum Health {
            AllRunning,
            SomeLost,
            AllLost,
        }

        let sessions: Vec<(SessionId, SessionStatus, Health)> = self.ctx.with_state(|s| {
            s.sessions
                .values()
                .filter(|sess| {
                    &sess.spec.resource_group == group
                        && matches!(
                            sess.status,
                            SessionStatus::Running | SessionStatus::RunningDegraded
                        )
                })
                .map(|sess| {
                    let kernels = s.kernels_of(sess);
                    let lost = kernels
                        .iter()
                        .filter(|k| k.status == KernelStatus::Lost)
                        .count();
                    let health = if lost == 0 {
                        Health::AllRunning
                    } else if lost == kernels.len() {
                        Health::AllLost
                    } else {
                        Health::SomeLost
                    };
                    (sess.id.clone(), sess.status, health)
                })
                .collect()
        });

        for (id, status, health) in sessions {
            match (status, health) {
                (SessionStatus::Running, Health::SomeLost) => {
                    self.transit_logged(
                        &id,
                        SessionStatus::Running,
                        SessionStatus::RunningDegraded,
                        Some("subset of kernels lost".into()),
                    )?;
                    report.degraded += 1;
                }
                (current, Health::AllLost) => {
                    // Destroys are best-effort (the agent is gone), but the
                    // reservations must come back.
                    self.dispatcher
                        .teardown_kernels(&id, token, Some("all kernels lost".into()))
                        .await?;
                    self.transit_logged(
                        &id,
                        current,
                        SessionStatus::Error,
                        Some("all kernels lost".into()),
                    )?;
                    report.dead += 1;
                }
                (SessionStatus::RunningDegraded, Health::AllRunning) => {
                    self.transit_logged(
                        &id,
                        SessionStatus::RunningDegraded,
                        SessionStatus::Running,
                        Some("kernels recovered".into()),
                    )?;
                    report.recovered += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Per-state stuck deadlines (group overrides first).
    async fn sweep_deadlines(
        &self,
        group: &ResourceGroupId,
        token: u64,
        report: &mut ReconcileReport,
    ) -> Result<(), SchedError> {
        let now_ms = self.ctx.clock.epoch_ms();
        let stuck: Vec<(SessionId, SessionStatus)> = self.ctx.with_state(|s| {
            s.sessions
                .values()
                .filter(|sess| &sess.spec.resource_group == group && !sess.is_terminal())
                .filter_map(|sess| {
                    let deadline = self.ctx.config.state_deadline(group, sess.status)?;
                    let age_ms = now_ms.saturating_sub(sess.status_changed_at_ms);
                    (age_ms > deadline.as_millis() as u64).then(|| (sess.id.clone(), sess.status))
                })
                .collect()
        });

        for (id, status) in stuck {
            let reason = format!("stuck in {status}");
            warn!(session = %id.short(8), %status, "state deadline exceeded");
            if status == SessionStatus::Terminating {
                // Teardown stalled: finish it.
                self.dispatcher
                    .teardown_kernels(&id, token, Some(reason.clone()))
                    .await?;
                self.transit_logged(
                    &id,
                    SessionStatus::Terminating,
                    SessionStatus::Terminated,
                    Some(reason),
                )?;
            } else {
                // Crash-safe rollback: clean up whatever dispatch created,
                // then land in ERROR.
                self.dispatcher
                    .teardown_kernels(&id, token, Some(reason.clone()))
                    .await?;
                self.transit_logged(&id, status, SessionStatus::Error, Some(reason))?;
            }
            report.stuck += 1;
        }
        Ok(())
    }

    /// Idle timeout and max-lifetime enforcement for running sessions.
    async fn sweep_expiry(
        &self,
        group: &ResourceGroupId,
        report: &mut ReconcileReport,
    ) -> Result<(), SchedError> {
        let now_ms = self.ctx.clock.epoch_ms();
        let expired: Vec<(SessionId, String)> = self.ctx.with_state(|s| {
            s.sessions
                .values()
                .filter(|sess| {
                    &sess.spec.resource_group == group
                        && matches!(
                            sess.status,
                            SessionStatus::Running | SessionStatus::RunningDegraded
                        )
                })
                .filter_map(|sess| {
                    let policy = self
                        .ctx
                        .config
                        .policy_for(&berth_core::Scope::Keypair(
                            sess.spec.owner.access_key.clone(),
                        ));
                    if let Some(idle_ms) = sess.idle_timeout_ms(policy.idle_timeout_ms) {
                        if now_ms.saturating_sub(sess.last_active_at_ms) > idle_ms {
                            return Some((sess.id.clone(), "idle timeout".to_string()));
                        }
                    }
                    let lifetime_ms = sess
                        .spec
                        .max_lifetime_ms
                        .or(policy.max_session_lifetime_ms);
                    if let Some(lifetime_ms) = lifetime_ms {
                        if now_ms.saturating_sub(sess.enqueued_at_ms) > lifetime_ms {
                            return Some((sess.id.clone(), "max lifetime exceeded".to_string()));
                        }
                    }
                    None
                })
                .collect()
        });

        for (id, reason) in expired {
            info!(session = %id.short(8), reason, "terminating expired session");
            self.dispatcher.destroy_session(&id, Some(reason)).await?;
            report.expired += 1;
        }
        Ok(())
    }

    fn transit_logged(
        &self,
        id: &SessionId,
        expect: SessionStatus,
        next: SessionStatus,
        reason: Option<String>,
    ) -> Result<(), SchedError> {
        let at_ms = self.ctx.clock.epoch_ms();
        let result = next.is_terminal().then_some(berth_core::SessionResult::Failure);
        let (_, event) = self
            .ctx
            .with_state_mut(|s| s.transit(id, expect, next, reason, result, at_ms))?;
        if let Some(event) = event {
            self.ctx.sink.emit(event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
