// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Explicit dependency bundle for the scheduler core.
//!
//! There are no process-wide singletons: the daemon builds one
//! [`CoreContext`] and hands narrower views to each sub-component.

use crate::error::SchedError;
use berth_config::Config;
use berth_core::{Clock, Event, IdGen};
use berth_rpc::{AgentClient, AgentPool};
use berth_storage::MaterializedState;
use parking_lot::Mutex;
use std::sync::Arc;

/// Durable event output.
///
/// `emit` appends the event to the WAL **and** applies it to the shared
/// materialized state before returning, so a caller observes its own write
/// on the next state read. Returns the global WAL sequence number.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: Event) -> Result<u64, SchedError>;
}

/// Everything the scheduler core needs, passed explicitly.
pub struct CoreContext<C: AgentClient, K: Clock> {
    pub state: Arc<Mutex<MaterializedState>>,
    pub sink: Arc<dyn EventSink>,
    pub config: Arc<Config>,
    pub pool: Arc<AgentPool<C>>,
    pub clock: K,
    pub ids: Arc<dyn IdGen>,
}

impl<C: AgentClient, K: Clock> CoreContext<C, K> {
    /// Run a closure under the state lock.
    pub fn with_state<T>(&self, f: impl FnOnce(&MaterializedState) -> T) -> T {
        let guard = self.state.lock();
        f(&guard)
    }

    pub fn with_state_mut<T>(&self, f: impl FnOnce(&mut MaterializedState) -> T) -> T {
        let mut guard = self.state.lock();
        f(&mut guard)
    }
}

impl<C: AgentClient, K: Clock> Clone for CoreContext<C, K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            sink: Arc::clone(&self.sink),
            config: Arc::clone(&self.config),
            pool: Arc::clone(&self.pool),
            clock: self.clock.clone(),
            ids: Arc::clone(&self.ids),
        }
    }
}
