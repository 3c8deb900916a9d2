// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Materialized state from WAL replay.
//!
//! Holds the session/kernel/agent records, the append-only status history,
//! the accounting ledger with its running totals, and per-resource-group
//! scheduler bookkeeping. `apply_event` is idempotent per event so the
//! executor may apply an event eagerly and the WAL replay may apply it again.
//!
//! Status changes go through [`MaterializedState::transit`]: a compare-and-set
//! on the session's status that rejects undeclared edges and reports lost
//! races with a typed stale error. Multi-replica safety layers the fenced
//! leader token on top (see the accounting layer); the CAS is the first line
//! of defense.

use berth_core::{
    AccountingDirection, Agent, AgentId, AgentStatus, Event, Kernel, KernelId, KernelStatus,
    LedgerAccount, ResourceGroupId, ResourceSlots, Scope, Session, SessionId, SessionResult,
    SessionStatus, StatusEntry, TransitionError,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

/// One journal row of the double-entry accounting ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: LedgerAccount,
    pub session_id: SessionId,
    pub kernel_id: KernelId,
    pub slots: ResourceSlots,
    pub direction: AccountingDirection,
    /// Fenced token of the leader that wrote this entry.
    pub token: u64,
}

/// Last reported view from an agent heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub reported_slots: ResourceSlots,
    pub running_kernels: Vec<KernelId>,
    pub at_ms: u64,
}

/// Durable per-resource-group scheduler bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupState {
    /// HoL-avoidance: unplaceable-attempt count per pending session.
    #[serde(default)]
    pub retries: HashMap<SessionId, u32>,
    /// Epoch ms of the last completed scheduling cycle.
    #[serde(default)]
    pub last_cycle_at_ms: u64,
    /// Highest fenced token observed in this group's ledger writes. Writes
    /// tagged with a smaller token come from a deposed leader.
    #[serde(default)]
    pub max_token: u64,
}

/// Outcome of a successful `transit` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitOutcome {
    /// The edge was applied; `seq` is the new status-history sequence.
    Applied { seq: u64 },
    /// `(session, next_status)` had already been applied; nothing changed
    /// and no history row was appended.
    AlreadyApplied,
}

/// Totals recomputed from the ledger journal, for drift checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuiltTotals {
    pub agents: HashMap<AgentId, ResourceSlots>,
    /// Keyed by scope display form ("keypair:AKIA…").
    pub scopes: HashMap<String, ResourceSlots>,
}

/// Materialized state built from WAL replay.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MaterializedState {
    pub sessions: HashMap<SessionId, Session>,
    /// Kernel arena; sessions reference kernels by id only.
    pub kernels: HashMap<KernelId, Kernel>,
    pub agents: HashMap<AgentId, Agent>,
    /// Append-only per-session status history.
    #[serde(default)]
    pub status_history: HashMap<SessionId, Vec<StatusEntry>>,
    /// Double-entry accounting journal, in write order.
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
    /// Running scope totals, keyed by scope display form.
    #[serde(default)]
    pub scope_used: HashMap<String, ResourceSlots>,
    /// Latest heartbeat payload per agent.
    #[serde(default)]
    pub heartbeats: HashMap<AgentId, Heartbeat>,
    /// Per-resource-group scheduler bookkeeping.
    #[serde(default)]
    pub groups: HashMap<ResourceGroupId, GroupState>,
}

impl MaterializedState {
    /// Look up a session by exact id or unique prefix.
    pub fn get_session(&self, id: &str) -> Option<&Session> {
        if let Some(session) = self.sessions.get(id) {
            return Some(session);
        }
        let mut matches = self.sessions.values().filter(|s| s.id.as_str().starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(session), None) => Some(session),
            _ => None,
        }
    }

    pub fn get_kernel(&self, id: &str) -> Option<&Kernel> {
        self.kernels.get(id)
    }

    pub fn get_agent(&self, id: &str) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Kernels of a session, in cluster-index order.
    pub fn kernels_of(&self, session: &Session) -> Vec<&Kernel> {
        let mut kernels: Vec<&Kernel> = session
            .kernel_ids
            .iter()
            .filter_map(|id| self.kernels.get(id.as_str()))
            .collect();
        kernels.sort_by_key(|k| k.cluster_idx);
        kernels
    }

    /// Pending sessions of a resource group, oldest first.
    pub fn pending_in_group(&self, group: &ResourceGroupId) -> Vec<&Session> {
        let mut pending: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && &s.spec.resource_group == group)
            .collect();
        pending.sort_by_key(|s| (s.enqueued_at_ms, s.id.clone()));
        pending
    }

    /// Schedulable agents of a resource group.
    pub fn agents_in_group(&self, group: &ResourceGroupId) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| &a.resource_group == group)
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// A non-terminal session of this owner with the given name, if any.
    /// Names are only unique among an owner's live sessions.
    pub fn live_session_named(&self, access_key: &str, name: &str) -> Option<&Session> {
        self.sessions
            .values()
            .find(|s| !s.is_terminal() && s.spec.name == name && s.spec.owner.access_key == access_key)
    }

    /// Running slot usage of a scope (kept by the ledger).
    pub fn scope_usage(&self, scope: &Scope) -> ResourceSlots {
        self.scope_used
            .get(&scope.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Sessions counted against a keypair's concurrency cap (scheduled
    /// through terminating; pending is capped separately).
    pub fn live_sessions_of_keypair(&self, access_key: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.status.holds_resources() && s.spec.owner.access_key == access_key)
            .count()
    }

    pub fn pending_sessions_of_keypair(&self, access_key: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Pending && s.spec.owner.access_key == access_key)
            .count()
    }

    pub fn group_state(&self, group: &ResourceGroupId) -> GroupState {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    /// Status history of a session (empty slice when unknown).
    pub fn history_of(&self, id: &SessionId) -> &[StatusEntry] {
        self.status_history.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The one legal durable status mutation.
    ///
    /// Idempotent on `(session, next)`: repeating an applied transition is a
    /// no-op success with no new history row. A caller whose `expect` no
    /// longer matches gets [`TransitionError::Stale`] and must reload.
    pub fn transit(
        &mut self,
        id: &SessionId,
        expect: SessionStatus,
        next: SessionStatus,
        reason: Option<String>,
        result: Option<SessionResult>,
        at_ms: u64,
    ) -> Result<(TransitOutcome, Option<Event>), TransitionError> {
        let session = self
            .sessions
            .get(id)
            .ok_or_else(|| TransitionError::NotFound(id.clone()))?;

        if session.status == next {
            return Ok((TransitOutcome::AlreadyApplied, None));
        }
        if session.status != expect {
            return Err(TransitionError::Stale {
                id: id.clone(),
                expected: expect,
                actual: session.status,
            });
        }
        if !expect.can_transition_to(next) {
            return Err(TransitionError::IllegalEdge {
                id: id.clone(),
                from: expect,
                to: next,
            });
        }

        let event = Event::SessionStatusChanged {
            id: id.clone(),
            status: next,
            reason,
            result,
            at_ms,
        };
        let seq = self.apply_status_change(&event);
        Ok((TransitOutcome::Applied { seq }, Some(event)))
    }

    /// Apply an event to the state. Idempotent per event.
    pub fn apply_event(&mut self, event: &Event) {
        match event {
            Event::SessionEnqueued {
                id,
                spec,
                kernel_ids,
                at_ms,
            } => {
                if self.sessions.contains_key(id) {
                    return;
                }
                let kernels = Kernel::seed(
                    kernel_ids,
                    id,
                    &spec.image,
                    &spec.architecture,
                    &spec.requested_slots,
                );
                for kernel in kernels {
                    self.kernels.insert(kernel.id.clone(), kernel);
                }
                let session = Session::new(id.clone(), spec.clone(), kernel_ids.clone(), *at_ms);
                self.status_history.entry(id.clone()).or_default().push(StatusEntry {
                    seq: 1,
                    status: SessionStatus::Pending,
                    reason: None,
                    at_ms: *at_ms,
                });
                self.sessions.insert(id.clone(), session);
            }

            Event::SessionStatusChanged { .. } => {
                self.apply_status_change(event);
            }

            Event::SessionTouched { id, at_ms } => {
                if let Some(session) = self.sessions.get_mut(id) {
                    session.last_active_at_ms = (*at_ms).max(session.last_active_at_ms);
                }
            }

            Event::KernelAssigned { kernel_id, agent_id } => {
                if let Some(kernel) = self.kernels.get_mut(kernel_id) {
                    kernel.agent_id = Some(agent_id.clone());
                }
            }

            Event::KernelDispatchStarted {
                kernel_id,
                attempt_seq,
            } => {
                if let Some(kernel) = self.kernels.get_mut(kernel_id) {
                    kernel.attempt_seq = kernel.attempt_seq.max(*attempt_seq);
                }
            }

            Event::KernelCreated {
                kernel_id,
                container_id,
                service_ports,
            } => {
                if let Some(kernel) = self.kernels.get_mut(kernel_id) {
                    kernel.container_id = Some(container_id.clone());
                    kernel.service_ports = service_ports.clone();
                }
            }

            Event::KernelStatusChanged {
                kernel_id,
                status,
                reason,
            } => {
                if let Some(kernel) = self.kernels.get_mut(kernel_id) {
                    kernel.status = *status;
                    if matches!(status, KernelStatus::Error | KernelStatus::Lost) {
                        kernel.error = reason.clone();
                    }
                }
            }

            Event::AgentJoined { agent } => {
                // Re-join refreshes capacity but keeps ledger-held occupancy.
                match self.agents.get_mut(&agent.id) {
                    Some(existing) => {
                        existing.addr = agent.addr.clone();
                        existing.total_slots = agent.total_slots.clone();
                        existing.architecture = agent.architecture.clone();
                        existing.concurrency_budget = agent.concurrency_budget;
                        existing.plugins = agent.plugins.clone();
                        existing.status = AgentStatus::Alive;
                        existing.last_heartbeat_ms = agent.last_heartbeat_ms;
                    }
                    None => {
                        self.agents.insert(agent.id.clone(), agent.clone());
                    }
                }
            }

            Event::AgentHeartbeat {
                agent_id,
                reported_slots,
                running_kernels,
                at_ms,
            } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.last_heartbeat_ms = (*at_ms).max(agent.last_heartbeat_ms);
                    if agent.status == AgentStatus::Lost {
                        agent.status = AgentStatus::Alive;
                    }
                }
                self.heartbeats.insert(
                    agent_id.clone(),
                    Heartbeat {
                        reported_slots: reported_slots.clone(),
                        running_kernels: running_kernels.clone(),
                        at_ms: *at_ms,
                    },
                );
            }

            Event::AgentStatusChanged {
                agent_id, status, ..
            } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.status = *status;
                }
            }

            Event::AgentDrainSet { agent_id, draining } => {
                if let Some(agent) = self.agents.get_mut(agent_id) {
                    agent.draining = *draining;
                }
            }

            Event::LedgerDelta {
                account,
                session_id,
                kernel_id,
                slots,
                direction,
                token,
            } => {
                self.ledger.push(LedgerEntry {
                    account: account.clone(),
                    session_id: session_id.clone(),
                    kernel_id: kernel_id.clone(),
                    slots: slots.clone(),
                    direction: *direction,
                    token: *token,
                });
                match account {
                    LedgerAccount::Agent(agent_id) => {
                        if let Some(agent) = self.agents.get_mut(agent_id) {
                            agent.occupied_slots = apply_delta(
                                &agent.occupied_slots,
                                slots,
                                *direction,
                                &format!("agent:{agent_id}"),
                            );
                        }
                    }
                    LedgerAccount::Scope(scope) => {
                        let key = scope.to_string();
                        let current = self.scope_used.remove(&key).unwrap_or_default();
                        self.scope_used
                            .insert(key.clone(), apply_delta(&current, slots, *direction, &key));
                    }
                }
                if let Some(group) = self
                    .sessions
                    .get(session_id)
                    .map(|s| s.spec.resource_group.clone())
                {
                    let gs = self.groups.entry(group).or_default();
                    gs.max_token = gs.max_token.max(*token);
                }
            }

            Event::SchedulerRetryNoted {
                group,
                session_id,
                retries,
            } => {
                let gs = self.groups.entry(group.clone()).or_default();
                if *retries == 0 {
                    gs.retries.remove(session_id);
                } else {
                    gs.retries.insert(session_id.clone(), *retries);
                }
            }

            Event::SchedulerCycleNoted { group, at_ms } => {
                let gs = self.groups.entry(group.clone()).or_default();
                gs.last_cycle_at_ms = (*at_ms).max(gs.last_cycle_at_ms);
            }

            Event::Custom => {}
        }
    }

    /// Shared application path for status changes (transit + replay).
    ///
    /// Returns the history sequence of the (possibly pre-existing) row.
    fn apply_status_change(&mut self, event: &Event) -> u64 {
        let Event::SessionStatusChanged {
            id,
            status,
            reason,
            result,
            at_ms,
        } = event
        else {
            return 0;
        };
        let already_applied = match self.sessions.get(id) {
            None => return 0,
            Some(session) => session.status == *status,
        };
        if already_applied {
            // Replay of an already-applied transition: keep history single.
            return self.history_of(id).last().map(|e| e.seq).unwrap_or(0);
        }

        if let Some(session) = self.sessions.get_mut(id) {
            session.status = *status;
            session.status_version += 1;
            session.status_changed_at_ms = *at_ms;
            if let Some(result) = result {
                session.result = *result;
            }
            if *status == SessionStatus::Error {
                session.error = reason.clone();
            }
        }

        let history = self.status_history.entry(id.clone()).or_default();
        let seq = history.last().map(|e| e.seq + 1).unwrap_or(1);
        history.push(StatusEntry {
            seq,
            status: *status,
            reason: reason.clone(),
            at_ms: *at_ms,
        });
        seq
    }

    /// Recompute account totals from the journal alone.
    ///
    /// The caller compares against the stored running totals; any mismatch
    /// is accounting drift, an invariant violation.
    pub fn rebuild_totals(&self) -> RebuiltTotals {
        let mut totals = RebuiltTotals::default();
        for entry in &self.ledger {
            match &entry.account {
                LedgerAccount::Agent(agent_id) => {
                    let current = totals.agents.entry(agent_id.clone()).or_default();
                    *current = apply_delta(
                        current,
                        &entry.slots,
                        entry.direction,
                        &format!("rebuild agent:{agent_id}"),
                    );
                }
                LedgerAccount::Scope(scope) => {
                    let key = scope.to_string();
                    let current = totals.scopes.entry(key.clone()).or_default();
                    *current = apply_delta(current, &entry.slots, entry.direction, &key);
                }
            }
        }
        totals
    }
}

/// Apply one accounting delta to a running total.
///
/// A release that would underflow is clamped to zero and logged: the journal
/// is authoritative, so underflow here means the running total drifted.
fn apply_delta(
    current: &ResourceSlots,
    slots: &ResourceSlots,
    direction: AccountingDirection,
    account: &str,
) -> ResourceSlots {
    match direction {
        AccountingDirection::Reserve => current.added(slots),
        AccountingDirection::Release => match current.subtracted(slots) {
            Ok(rest) => rest,
            Err(e) => {
                error!(account, error = %e, "accounting release underflow, clamping to zero");
                slots
                    .names()
                    .fold(current.clone(), |mut acc, name| {
                        let have = acc.get(name.as_str());
                        let need = slots.get(name.as_str());
                        acc.insert(
                            name.clone(),
                            have.checked_sub(need).unwrap_or(berth_core::Quantity::ZERO),
                        );
                        acc
                    })
            }
        },
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
