// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduling cycle.
//!
//! One logical task per resource group: acquire the leader lease, snapshot
//! the queue and the fleet, rank candidates with the configured queue
//! policy, and place the first candidate that fits. Reservations are
//! speculative against a snapshot clone until the moment the session
//! transits PENDING → SCHEDULED and the ledger legs are written under the
//! lease's fenced token.

use crate::accounting::Accounting;
use crate::context::{CoreContext, EventSink};
use crate::error::SchedError;
use crate::lease::LeaderLease;
use crate::placement::{plan_session, AgentSelector, PlacementSnapshot};
use crate::queue::{
    dependency_gate, dominant_share, fits_group_capacity, PendingCandidate, PolicyVerdict,
    QueueView, SessionSelector,
};
use berth_core::{Clock, Event, ResourceGroupId, SessionId, SessionStatus};
use berth_rpc::AgentClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one cycle did, for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another replica leads this group.
    NotLeader,
    /// Nothing pending or nothing eligible.
    Idle,
    /// Attempted candidates, placed none; retries were bumped.
    NonePlaced,
    /// Placed one session; it is ready for dispatch.
    Placed(SessionId),
}

/// The per-group scheduling loop.
pub struct SchedulerLoop<C: AgentClient, K: Clock> {
    ctx: CoreContext<C, K>,
    accounting: Arc<Accounting>,
    lease: Arc<dyn LeaderLease>,
    selector: Box<dyn SessionSelector>,
    agent_selector: Box<dyn AgentSelector>,
    /// Scheduled sessions are handed to the dispatch coordinator here.
    dispatch_tx: mpsc::Sender<(SessionId, u64)>,
    cancel: CancellationToken,
}

impl<C: AgentClient, K: Clock + 'static> SchedulerLoop<C, K> {
    pub fn new(
        ctx: CoreContext<C, K>,
        lease: Arc<dyn LeaderLease>,
        selector: Box<dyn SessionSelector>,
        agent_selector: Box<dyn AgentSelector>,
        dispatch_tx: mpsc::Sender<(SessionId, u64)>,
        cancel: CancellationToken,
    ) -> Self {
        let accounting = Arc::new(Accounting::new(
            Arc::clone(&ctx.state),
            Arc::clone(&ctx.sink),
            Arc::clone(&ctx.config),
        ));
        Self {
            ctx,
            accounting,
            lease,
            selector,
            agent_selector,
            dispatch_tx,
            cancel,
        }
    }

    /// Run until cancelled: a cycle per tick or wake event, per group.
    pub async fn run(mut self, mut wake_rx: mpsc::Receiver<()>) {
        let tick = self.ctx.config.scheduler.tick_interval;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("scheduler loop stopping");
                    return;
                }
                _ = wake_rx.recv() => {}
                _ = tokio::time::sleep(tick) => {}
            }

            let groups: Vec<ResourceGroupId> =
                self.ctx.config.resource_groups.keys().cloned().collect();
            for group in groups {
                match self.run_cycle(&group).await {
                    Ok(CycleOutcome::Placed(id)) => {
                        debug!(group = %group, session = %id.short(8), "cycle placed a session");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(group = %group, error = %e, "scheduling cycle failed"),
                }
            }
        }
    }

    /// One scheduling cycle for one resource group.
    pub async fn run_cycle(&mut self, group: &ResourceGroupId) -> Result<CycleOutcome, SchedError> {
        let started = self.ctx.clock.now();
        let ttl = self.ctx.config.scheduler.leader_lock_ttl;
        let Some(lease) = self.lease.acquire(group, ttl)? else {
            return Ok(CycleOutcome::NotLeader);
        };
        let token = lease.token;

        let outcome = self.cycle_under_lease(group, token).await;

        self.ctx.sink.emit(Event::SchedulerCycleNoted {
            group: group.clone(),
            at_ms: self.ctx.clock.epoch_ms(),
        })?;
        self.lease.release(lease)?;

        let elapsed = started.elapsed();
        if elapsed > self.ctx.config.scheduler.cycle_warn_after {
            // Safety is still bounded by the lease TTL; this is a smell, not
            // a correctness problem.
            warn!(group = %group, elapsed_ms = elapsed.as_millis() as u64, "slow scheduling cycle");
        }

        outcome
    }

    async fn cycle_under_lease(
        &mut self,
        group: &ResourceGroupId,
        token: u64,
    ) -> Result<CycleOutcome, SchedError> {
        // Snapshot queue + fleet under one lock.
        let (candidates, snapshot, retries) = self.ctx.with_state(|s| {
            let candidates: Vec<PendingCandidate> = s
                .pending_in_group(group)
                .into_iter()
                .map(PendingCandidate::from_session)
                .collect();
            let snapshot = PlacementSnapshot::from_state(s, group);
            let retries = s.group_state(group).retries;
            (candidates, snapshot, retries)
        });

        if candidates.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let view = self.build_view(&candidates, &snapshot, retries)?;
        let ranked = self.selector.rank(&candidates, &view);
        if ranked.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        let by_id: HashMap<&SessionId, &PendingCandidate> =
            candidates.iter().map(|c| (&c.id, c)).collect();

        let mut any_attempted = false;
        for id in &ranked {
            let Some(candidate) = by_id.get(id) else {
                continue;
            };
            match self.attempt(candidate, group, &snapshot, token).await? {
                PolicyVerdict::Placed => {
                    // Successful placement resets the HoL counter and
                    // records a bypass on every head it overtook.
                    if view.retries.contains_key(id) {
                        self.ctx.sink.emit(Event::SchedulerRetryNoted {
                            group: group.clone(),
                            session_id: id.clone(),
                            retries: 0,
                        })?;
                    }
                    for (bypassed, retries) in
                        self.selector.bypass_updates(id, &candidates, &view)
                    {
                        self.ctx.sink.emit(Event::SchedulerRetryNoted {
                            group: group.clone(),
                            session_id: bypassed,
                            retries,
                        })?;
                    }
                    let _ = self.dispatch_tx.send((id.clone(), token)).await;
                    return Ok(CycleOutcome::Placed(id.clone()));
                }
                PolicyVerdict::Skipped(reason) => {
                    debug!(session = %id.short(8), reason, "skipped this cycle");
                }
                PolicyVerdict::Retry(reason) => {
                    any_attempted = true;
                    let bumped = view.retries.get(id).copied().unwrap_or(0) + 1;
                    debug!(session = %id.short(8), reason, retries = bumped, "unplaceable");
                    self.ctx.sink.emit(Event::SchedulerRetryNoted {
                        group: group.clone(),
                        session_id: id.clone(),
                        retries: bumped,
                    })?;
                }
            }
        }

        Ok(if any_attempted {
            CycleOutcome::NonePlaced
        } else {
            CycleOutcome::Idle
        })
    }

    fn build_view(
        &self,
        candidates: &[PendingCandidate],
        snapshot: &PlacementSnapshot,
        retries: HashMap<SessionId, u32>,
    ) -> Result<QueueView, SchedError> {
        let free = snapshot.free_all();
        let mut fits = HashMap::new();
        let mut shares = HashMap::new();
        let mut blocked = HashMap::new();
        let mut impossible: Vec<(SessionId, String)> = Vec::new();
        self.ctx.with_state(|s| {
            for candidate in candidates {
                fits.insert(candidate.id.clone(), fits_group_capacity(candidate, &free));
                shares.insert(
                    candidate.id.clone(),
                    dominant_share(candidate, s, &self.ctx.config),
                );
                match dependency_gate(candidate, s) {
                    Ok(satisfied) => {
                        blocked.insert(candidate.id.clone(), !satisfied);
                    }
                    Err(reason) => {
                        blocked.insert(candidate.id.clone(), true);
                        impossible.push((candidate.id.clone(), reason));
                    }
                }
            }
        });

        // A dependency that can never succeed cancels the dependent.
        for (id, reason) in impossible {
            let (_, event) = self.ctx.with_state_mut(|s| {
                s.transit(
                    &id,
                    SessionStatus::Pending,
                    SessionStatus::Cancelled,
                    Some(reason),
                    None,
                    self.ctx.clock.epoch_ms(),
                )
            })?;
            if let Some(event) = event {
                self.ctx.sink.emit(event)?;
            }
        }

        Ok(QueueView {
            now_ms: self.ctx.clock.epoch_ms(),
            retries,
            hol_block_threshold: self.ctx.config.scheduler.hol_block_threshold,
            hol_overtake_window: self.ctx.config.scheduler.hol_overtake_window,
            fits,
            blocked,
            shares,
        })
    }

    /// Gate checks + placement + commit for one candidate.
    async fn attempt(
        &mut self,
        candidate: &PendingCandidate,
        group: &ResourceGroupId,
        snapshot: &PlacementSnapshot,
        token: u64,
    ) -> Result<PolicyVerdict, SchedError> {
        // Scope quota gate: capacity conditions are queue state, not retries.
        let (session, kernels) = self.ctx.with_state(|s| {
            let session = s.sessions.get(&candidate.id).cloned();
            let kernels = session
                .as_ref()
                .map(|sess| {
                    s.kernels_of(sess)
                        .into_iter()
                        .cloned()
                        .collect::<Vec<berth_core::Kernel>>()
                })
                .unwrap_or_default();
            (session, kernels)
        });
        let Some(session) = session else {
            return Ok(PolicyVerdict::Skipped("session vanished".into()));
        };
        if let Err(reason) = self.accounting.fits_scopes(&session, &candidate.total_slots) {
            return Ok(PolicyVerdict::Skipped(reason));
        }

        // Placement over the snapshot.
        let kernel_refs: Vec<&berth_core::Kernel> = kernels.iter().collect();
        let plan = match plan_session(&session, &kernel_refs, snapshot, self.agent_selector.as_ref())
        {
            Ok(plan) => plan,
            Err(reason) => return Ok(PolicyVerdict::Retry(reason)),
        };

        // Commit: assignments + ledger legs + the CAS transition.
        for (kernel_id, agent_id) in &plan {
            self.ctx.sink.emit(Event::KernelAssigned {
                kernel_id: kernel_id.clone(),
                agent_id: agent_id.clone(),
            })?;
        }
        for kernel in &kernels {
            let agent_id = plan
                .iter()
                .find(|(kid, _)| kid == &kernel.id)
                .map(|(_, aid)| aid.clone())
                .ok_or_else(|| {
                    SchedError::Invariant(format!("kernel {} missing from plan", kernel.id))
                })?;
            self.accounting.reserve_kernel(&session, kernel, &agent_id, token)?;
        }

        let (_, event) = self.ctx.with_state_mut(|s| {
            s.transit(
                &candidate.id,
                SessionStatus::Pending,
                SessionStatus::Scheduled,
                None,
                None,
                self.ctx.clock.epoch_ms(),
            )
        })?;
        if let Some(event) = event {
            self.ctx.sink.emit(event)?;
        }

        info!(
            session = %candidate.id.short(8),
            group = %group,
            kernels = plan.len(),
            "session scheduled"
        );
        Ok(PolicyVerdict::Placed)
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
