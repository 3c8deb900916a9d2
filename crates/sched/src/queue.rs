// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session-selection (queue) policies.
//!
//! A policy ranks the pending sessions of one resource group; the scheduler
//! attempts placement in ranked order until one succeeds or the prefix is
//! exhausted for the cycle. Policies are pure over a [`QueueView`] snapshot;
//! retry bookkeeping is durable in the group's scheduler state and mutated
//! only by the cycle itself.

use berth_config::{Config, SessionPolicyKind};
use berth_core::{ResourceSlots, Scope, SessionId, SessionStatus};
use berth_storage::MaterializedState;
use std::collections::HashMap;

/// Outcome of one placement attempt, as data rather than control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    /// Kernels were assigned; the session moved to SCHEDULED.
    Placed,
    /// Not eligible this cycle (dependency gate, future start, quota);
    /// does not count against the HoL threshold.
    Skipped(String),
    /// Eligible but unplaceable; counts toward HoL avoidance.
    Retry(String),
}

/// A pending session as the queue policies see it.
#[derive(Debug, Clone)]
pub struct PendingCandidate {
    pub id: SessionId,
    pub enqueued_at_ms: u64,
    pub priority: i32,
    /// Slots for the whole cluster (per-kernel × size).
    pub total_slots: ResourceSlots,
    pub starts_at_ms: Option<u64>,
    pub dependencies: Vec<SessionId>,
    /// The owning keypair scope, for fair-share accounting.
    pub owner_scope: Scope,
}

impl PendingCandidate {
    pub fn from_session(session: &berth_core::Session) -> Self {
        Self {
            id: session.id.clone(),
            enqueued_at_ms: session.enqueued_at_ms,
            priority: session.spec.priority,
            total_slots: session.total_requested(),
            starts_at_ms: session.spec.kind.starts_at_ms(),
            dependencies: session.spec.kind.dependencies().to_vec(),
            owner_scope: Scope::Keypair(session.spec.owner.access_key.clone()),
        }
    }

    /// A `starts_at` in the past counts as eligible now.
    pub fn eligible_at(&self, now_ms: u64) -> bool {
        self.starts_at_ms.is_none_or(|t| t <= now_ms)
    }
}

/// Immutable inputs to a ranking pass.
pub struct QueueView {
    pub now_ms: u64,
    /// Durable unplaceable-attempt counts (HoL bookkeeping). Bumped on
    /// failed placement attempts and on bypasses of a blocked head.
    pub retries: HashMap<SessionId, u32>,
    pub hol_block_threshold: u32,
    pub hol_overtake_window: u32,
    /// Whether the whole-cluster request currently fits the group's free
    /// capacity (used to decide which younger candidates may overtake).
    pub fits: HashMap<SessionId, bool>,
    /// Candidates whose batch dependencies are not satisfied yet. Invisible
    /// to ranking this cycle; being blocked never counts as a failure.
    pub blocked: HashMap<SessionId, bool>,
    /// Dominant share of each candidate's owning scope (DRF input).
    pub shares: HashMap<SessionId, f64>,
}

impl QueueView {
    pub fn retries_of(&self, id: &SessionId) -> u32 {
        self.retries.get(id).copied().unwrap_or(0)
    }

    /// Whether the candidate's whole request currently fits the group.
    pub fn fits(&self, id: &SessionId) -> bool {
        self.fits.get(id).copied().unwrap_or(false)
    }

    fn is_blocked(&self, id: &SessionId) -> bool {
        self.blocked.get(id).copied().unwrap_or(false)
    }
}

/// A queue policy: rank the pending sessions for one cycle.
pub trait SessionSelector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ranked prefix of candidates to attempt, best first. Candidates not
    /// yet eligible (future `starts_at`, unmet dependencies) are excluded.
    fn rank(&self, pending: &[PendingCandidate], view: &QueueView) -> Vec<SessionId>;

    /// Durable retry-count updates owed after a successful placement
    /// (e.g. recording that a blocked head was bypassed). Default: none.
    fn bypass_updates(
        &self,
        _placed: &SessionId,
        _pending: &[PendingCandidate],
        _view: &QueueView,
    ) -> Vec<(SessionId, u32)> {
        Vec::new()
    }
}

fn fifo_key(c: &PendingCandidate) -> (u64, u64, SessionId) {
    (c.starts_at_ms.unwrap_or(0), c.enqueued_at_ms, c.id.clone())
}

/// Heuristic FIFO with head-of-line-blocking avoidance.
///
/// Orders by (starts-at, enqueue time) and attempts only the head: an
/// unplaceable head blocks everything younger, accumulating one retry per
/// cycle. Once its count reaches the threshold the head is deferred and
/// younger fittable candidates may pass it, at most K of them per blocking
/// episode; every bypass is recorded on the head's counter so it cycles
/// back to the front after K overtakes. Retries reset on placement.
#[derive(Debug, Default, Clone)]
pub struct FifoPolicy;

impl FifoPolicy {
    /// A head is deferred while it sits in the "bypass" phase of its
    /// counter: K cycles of being overtaken, then one fresh attempt.
    fn is_deferred(&self, retries: u32, view: &QueueView) -> bool {
        if retries < view.hol_block_threshold {
            return false;
        }
        let window = view.hol_overtake_window.max(1);
        (retries - view.hol_block_threshold) % (window + 1) < window
    }
}

impl SessionSelector for FifoPolicy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn rank(&self, pending: &[PendingCandidate], view: &QueueView) -> Vec<SessionId> {
        let mut sorted: Vec<&PendingCandidate> = pending
            .iter()
            .filter(|c| c.eligible_at(view.now_ms) && !view.is_blocked(&c.id))
            .collect();
        sorted.sort_by_key(|c| fifo_key(c));

        let mut out: Vec<SessionId> = Vec::new();
        let mut deferred: Vec<SessionId> = Vec::new();

        for candidate in sorted {
            if self.is_deferred(view.retries_of(&candidate.id), view) {
                deferred.push(candidate.id.clone());
                continue;
            }
            // The first non-deferred candidate is the barrier: strictly
            // younger candidates may not be attempted this cycle.
            out.push(candidate.id.clone());
            break;
        }

        out.extend(deferred);
        out
    }

    fn bypass_updates(
        &self,
        placed: &SessionId,
        pending: &[PendingCandidate],
        view: &QueueView,
    ) -> Vec<(SessionId, u32)> {
        let Some(placed_candidate) = pending.iter().find(|c| &c.id == placed) else {
            return Vec::new();
        };
        let placed_key = fifo_key(placed_candidate);
        pending
            .iter()
            .filter(|c| {
                c.id != *placed
                    && fifo_key(c) < placed_key
                    && self.is_deferred(view.retries_of(&c.id), view)
            })
            .map(|c| (c.id.clone(), view.retries_of(&c.id) + 1))
            .collect()
    }
}

/// Dominant Resource Fairness: lowest dominant share first.
#[derive(Debug, Default, Clone)]
pub struct DrfPolicy;

impl SessionSelector for DrfPolicy {
    fn name(&self) -> &'static str {
        "drf"
    }

    fn rank(&self, pending: &[PendingCandidate], view: &QueueView) -> Vec<SessionId> {
        let mut sorted: Vec<&PendingCandidate> = pending
            .iter()
            .filter(|c| c.eligible_at(view.now_ms) && !view.is_blocked(&c.id))
            .collect();
        sorted.sort_by(|a, b| {
            let share_a = view.shares.get(&a.id).copied().unwrap_or(0.0);
            let share_b = view.shares.get(&b.id).copied().unwrap_or(0.0);
            share_a
                .partial_cmp(&share_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.enqueued_at_ms.cmp(&b.enqueued_at_ms))
                .then_with(|| a.id.cmp(&b.id))
        });
        sorted.into_iter().map(|c| c.id.clone()).collect()
    }
}

/// Priority queue: higher priority first, FIFO within a priority band.
#[derive(Debug, Default, Clone)]
pub struct PriorityPolicy;

impl SessionSelector for PriorityPolicy {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn rank(&self, pending: &[PendingCandidate], view: &QueueView) -> Vec<SessionId> {
        let mut sorted: Vec<&PendingCandidate> = pending
            .iter()
            .filter(|c| c.eligible_at(view.now_ms) && !view.is_blocked(&c.id))
            .collect();
        sorted.sort_by_key(|c| (std::cmp::Reverse(c.priority), c.enqueued_at_ms, c.id.clone()));
        sorted.into_iter().map(|c| c.id.clone()).collect()
    }
}

/// Instantiate the configured queue policy.
pub fn selector_from_config(config: &Config) -> Box<dyn SessionSelector> {
    match config.scheduler.session_policy {
        SessionPolicyKind::Fifo => Box::new(FifoPolicy),
        SessionPolicyKind::Drf => Box::new(DrfPolicy),
        SessionPolicyKind::Priority => Box::new(PriorityPolicy),
    }
}

/// Dependency gate for batch sessions: every declared dependency must be
/// TERMINATED with a success result. A blocked candidate is skipped without
/// a retry increment; an impossible one (dependency cancelled or failed) is
/// reported so the caller can cancel it.
pub fn dependency_gate(
    candidate: &PendingCandidate,
    state: &MaterializedState,
) -> Result<bool, String> {
    for dep in &candidate.dependencies {
        match state.sessions.get(dep) {
            None => return Err(format!("dependency {dep} does not exist")),
            Some(dep_session) => match dep_session.status {
                SessionStatus::Terminated
                    if dep_session.result == berth_core::SessionResult::Success => {}
                SessionStatus::Terminated | SessionStatus::Cancelled | SessionStatus::Error => {
                    return Err(format!("dependency {dep} finished without success"));
                }
                _ => return Ok(false),
            },
        }
    }
    Ok(true)
}

/// Compute the DRF dominant share of a candidate's owning scope.
pub fn dominant_share(
    candidate: &PendingCandidate,
    state: &MaterializedState,
    config: &Config,
) -> f64 {
    let policy = config.policy_for(&candidate.owner_scope);
    if policy.total_slots.is_empty() {
        return 0.0;
    }
    state
        .scope_usage(&candidate.owner_scope)
        .dominant_share_against(&policy.total_slots)
}

/// Whether a candidate's whole-cluster request fits the group's free slots.
///
/// This is the coarse cluster-wide check used by HoL avoidance; the actual
/// placement still validates per agent.
pub fn fits_group_capacity(candidate: &PendingCandidate, free: &[ResourceSlots]) -> bool {
    // Single-agent fit is sufficient for single-node; for multi-node this is
    // an optimistic union check, refined during placement rounds.
    let mut total = ResourceSlots::new();
    for slots in free {
        total = total.added(slots);
    }
    candidate.total_slots.fits_within(&total)
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
