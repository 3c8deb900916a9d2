// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! berth-storage: durable state for the manager.
//!
//! Events are appended to a JSONL write-ahead log before they are applied;
//! the materialized state is rebuilt from snapshot + replay on startup. The
//! background checkpointer compresses snapshots off the hot path and the WAL
//! is truncated only after a snapshot is durable.

mod checkpoint;
mod snapshot;
mod state;
mod wal;

pub use checkpoint::{
    load_snapshot, CheckpointError, CheckpointHandle, CheckpointResult, Checkpointer,
};
pub use snapshot::{Snapshot, SnapshotError, CURRENT_SNAPSHOT_VERSION};
pub use state::{
    GroupState, Heartbeat, LedgerEntry, MaterializedState, RebuiltTotals, TransitOutcome,
};
pub use wal::{Wal, WalEntry, WalError};
