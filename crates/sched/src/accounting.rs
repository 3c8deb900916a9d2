// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Resource accounting over the double-entry ledger.
//!
//! Every reservation writes one delta against the agent account and one per
//! ownership scope, all tagged with the leader's fenced token. Releases
//! mirror reservations exactly, so replaying the journal from empty must
//! reproduce the stored running totals; `recalculate` checks that and
//! rewrites totals when they drifted.

use crate::context::EventSink;
use crate::error::SchedError;
use berth_config::Config;
use berth_core::{
    AccountingDirection, AgentId, Event, Kernel, LedgerAccount, ResourceSlots, Scope, Session,
};
use berth_storage::MaterializedState;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{error, info};

/// Accounting façade over shared state + event sink.
pub struct Accounting {
    state: Arc<Mutex<MaterializedState>>,
    sink: Arc<dyn EventSink>,
    config: Arc<Config>,
}

/// What `recalculate` found and fixed.
#[derive(Debug, Clone, Default)]
pub struct RecalcReport {
    /// Human-readable drift descriptions; empty means totals were exact.
    pub drift: Vec<String>,
}

impl RecalcReport {
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty()
    }
}

impl Accounting {
    pub fn new(
        state: Arc<Mutex<MaterializedState>>,
        sink: Arc<dyn EventSink>,
        config: Arc<Config>,
    ) -> Self {
        Self { state, sink, config }
    }

    /// Current slot usage of a scope.
    pub fn occupancy(&self, scope: &Scope) -> ResourceSlots {
        self.state.lock().scope_usage(scope)
    }

    /// Slots still free on an agent.
    pub fn agent_free(&self, agent_id: &AgentId) -> ResourceSlots {
        self.state
            .lock()
            .get_agent(agent_id.as_str())
            .map(|a| a.free_slots())
            .unwrap_or_default()
    }

    /// Headroom a scope has left under its policy caps.
    pub fn scope_remaining(&self, scope: &Scope) -> ResourceSlots {
        let policy = self.config.policy_for(scope);
        let used = self.occupancy(scope);
        policy.remaining(&used)
    }

    /// Whether a request fits every scope cap of the owner.
    pub fn fits_scopes(&self, session: &Session, request: &ResourceSlots) -> Result<(), String> {
        for scope in session.spec.owner.scopes() {
            let policy = self.config.policy_for(&scope);
            if policy.total_slots.is_empty() {
                continue;
            }
            let used = self.occupancy(&scope);
            let after = used.added(request);
            if !after.fits_within(&policy.total_slots) {
                return Err(format!("quota of {scope} exceeded"));
            }
        }
        Ok(())
    }

    /// Write the reserve legs for one placed kernel.
    ///
    /// The fenced `token` must be at least the group's high-water mark; a
    /// smaller token means a deposed leader is still writing and the call is
    /// rejected before anything reaches the WAL.
    pub fn reserve_kernel(
        &self,
        session: &Session,
        kernel: &Kernel,
        agent_id: &AgentId,
        token: u64,
    ) -> Result<(), SchedError> {
        self.write_legs(session, kernel, agent_id, AccountingDirection::Reserve, token)
    }

    /// Write the release legs for one kernel (terminated or errored).
    pub fn release_kernel(
        &self,
        session: &Session,
        kernel: &Kernel,
        agent_id: &AgentId,
        token: u64,
    ) -> Result<(), SchedError> {
        self.write_legs(session, kernel, agent_id, AccountingDirection::Release, token)
    }

    fn write_legs(
        &self,
        session: &Session,
        kernel: &Kernel,
        agent_id: &AgentId,
        direction: AccountingDirection,
        token: u64,
    ) -> Result<(), SchedError> {
        self.check_fence(session, token)?;

        let mut accounts = vec![LedgerAccount::Agent(agent_id.clone())];
        accounts.extend(session.spec.owner.scopes().into_iter().map(LedgerAccount::Scope));

        for account in accounts {
            self.sink.emit(Event::LedgerDelta {
                account,
                session_id: session.id.clone(),
                kernel_id: kernel.id.clone(),
                slots: kernel.allocated_slots.clone(),
                direction,
                token,
            })?;
        }
        Ok(())
    }

    fn check_fence(&self, session: &Session, token: u64) -> Result<(), SchedError> {
        let current = self
            .state
            .lock()
            .group_state(&session.spec.resource_group)
            .max_token;
        if token < current {
            return Err(SchedError::StaleLease { held: token, current });
        }
        Ok(())
    }

    /// Recompute totals from the journal and rewrite any drifted column.
    ///
    /// Drift is an invariant violation: it is logged at error level and the
    /// stored totals are rewritten to match the journal, which is the
    /// authoritative record.
    pub fn recalculate(&self) -> RecalcReport {
        let mut report = RecalcReport::default();
        let mut state = self.state.lock();
        let rebuilt = state.rebuild_totals();

        let agent_ids: Vec<AgentId> = state.agents.keys().cloned().collect();
        for agent_id in agent_ids {
            let derived = rebuilt.agents.get(&agent_id).cloned().unwrap_or_default();
            let stored = state
                .get_agent(agent_id.as_str())
                .map(|a| a.occupied_slots.clone())
                .unwrap_or_default();
            if stored != derived {
                let line = format!(
                    "agent {agent_id}: stored {stored:?} != journal {derived:?}"
                );
                error!(account = %agent_id, "accounting drift detected, rewriting from journal");
                report.drift.push(line);
                if let Some(agent) = state.agents.get_mut(&agent_id) {
                    agent.occupied_slots = derived;
                }
            }
        }

        // Scopes present either in totals or in the journal.
        let mut scope_keys: Vec<String> = state.scope_used.keys().cloned().collect();
        for key in rebuilt.scopes.keys() {
            if !scope_keys.contains(key) {
                scope_keys.push(key.clone());
            }
        }
        for key in scope_keys {
            let derived = rebuilt.scopes.get(&key).cloned().unwrap_or_default();
            let stored = state.scope_used.get(&key).cloned().unwrap_or_default();
            if stored != derived {
                let line = format!("scope {key}: stored {stored:?} != journal {derived:?}");
                error!(account = %key, "accounting drift detected, rewriting from journal");
                report.drift.push(line);
                state.scope_used.insert(key, derived);
            }
        }

        if report.is_clean() {
            info!(entries = state.ledger.len(), "usage recalculated, no drift");
        }
        report
    }
}

#[cfg(test)]
#[path = "accounting_tests.rs"]
mod tests;
