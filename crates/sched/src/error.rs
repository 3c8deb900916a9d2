// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the scheduler core.
//!
//! Five kinds, five behaviors: validation surfaces to the caller, capacity
//! shows up as queue state, transient is retried internally with backoff,
//! permanent lands the session in ERROR, and invariant violations are logged
//! loudly and trigger reconciliation.

use berth_core::TransitionError;
use berth_rpc::RpcError;
use thiserror::Error;

/// Broad classification driving retry and surfacing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-fixable; surfaced immediately, never enqueued.
    Validation,
    /// Not enough resources; observable as queue state, not an error page.
    Capacity,
    /// Network blips, lost CAS races, lease churn; retried with backoff.
    Transient,
    /// Will not succeed on retry; lands the session in ERROR.
    Permanent,
    /// Accounting drift, orphans, illegal edges; never silent.
    InvariantViolation,
}

berth_core::simple_display! {
    ErrorKind {
        Validation => "validation",
        Capacity => "capacity",
        Transient => "transient",
        Permanent => "permanent",
        InvariantViolation => "invariant-violation",
    }
}

/// Errors from scheduler-core operations.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("capacity: {0}")]
    Capacity(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    /// A deposed leader tried to write; caller must re-acquire the lease.
    #[error("stale lease token {held} (current {current})")]
    StaleLease { held: u64, current: u64 },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("storage: {0}")]
    Storage(String),
}

impl SchedError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedError::Validation(_) | SchedError::NotFound(_) | SchedError::Conflict(_) => {
                ErrorKind::Validation
            }
            SchedError::Capacity(_) => ErrorKind::Capacity,
            SchedError::Transient(_) | SchedError::StaleLease { .. } => ErrorKind::Transient,
            SchedError::Permanent(_) => ErrorKind::Permanent,
            SchedError::Invariant(_) => ErrorKind::InvariantViolation,
            // A lost CAS race is retriable; an illegal edge is a bug.
            SchedError::Transition(TransitionError::Stale { .. }) => ErrorKind::Transient,
            SchedError::Transition(TransitionError::NotFound(_)) => ErrorKind::Validation,
            SchedError::Transition(TransitionError::IllegalEdge { .. }) => {
                ErrorKind::InvariantViolation
            }
            SchedError::Storage(_) => ErrorKind::Transient,
        }
    }

    /// Classify a southbound RPC failure.
    pub fn from_rpc(error: RpcError) -> Self {
        if error.is_retriable() {
            SchedError::Transient(error.to_string())
        } else {
            SchedError::Permanent(error.to_string())
        }
    }
}

impl From<berth_storage::WalError> for SchedError {
    fn from(e: berth_storage::WalError) -> Self {
        SchedError::Storage(e.to_string())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
