// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! berth-sched: the scheduler core.
//!
//! Composes the pieces the manager is really about: resource accounting over
//! the ledger, the pluggable session-selection (queue) and agent-selection
//! (placement) policies, the per-resource-group leader lease with fenced
//! tokens, the dispatch coordinator that drives kernels onto agents, the
//! scheduling cycle itself, and the lifecycle reconciler that unsticks
//! whatever the happy path left behind.

mod accounting;
mod context;
mod dispatch;
mod error;
mod lease;
mod ops;
mod placement;
mod queue;
mod reconcile;
mod scheduler;

pub use accounting::{Accounting, RecalcReport};
pub use context::{CoreContext, EventSink};
pub use dispatch::Dispatcher;
pub use error::{ErrorKind, SchedError};
pub use lease::{FileLease, Lease, LeaderLease, MemoryLease};
pub use ops::{EnqueueRequest, Ops, SessionQuery, WriteReceipt};
pub use placement::{
    plan_session, selector_from_config as agent_selector_from_config, AgentFreeView,
    AgentSelector, Concentrated, CustomHook, CustomSelector, Dispersed, HookRegistry,
    PlacementSnapshot,
};
pub use queue::{
    selector_from_config, DrfPolicy, FifoPolicy, PendingCandidate, PolicyVerdict, PriorityPolicy,
    QueueView, SessionSelector,
};
pub use reconcile::{ReconcileReport, Reconciler};
pub use scheduler::{CycleOutcome, SchedulerLoop};

#[cfg(any(test, feature = "test-support"))]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
pub mod test_support;
