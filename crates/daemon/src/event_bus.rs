// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable event plumbing for the daemon.
//!
//! One WAL sits behind two faces. [`EventBus`] is the cloneable write
//! handle; every subsystem emits through it (usually via [`WalSink`], which
//! also applies the event to live state). [`EngineFeed`] is the single
//! consumer: the engine loop drains it to advance the processed watermark
//! and compacts the log once a checkpoint is durable. Appends are buffered
//! and group-committed (~10ms durability window); crash recovery is
//! snapshot + replay of the tail.

use berth_core::Event;
use berth_sched::{EventSink, SchedError};
use berth_storage::{MaterializedState, Wal, WalEntry, WalError};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// The shared journal: the WAL plus the engine's wake signal.
struct Journal {
    wal: Mutex<Wal>,
    wake: Notify,
}

/// Cloneable write handle over the shared journal.
#[derive(Clone)]
pub struct EventBus {
    journal: Arc<Journal>,
}

/// The engine loop's consuming handle; exactly one per daemon.
pub struct EngineFeed {
    journal: Arc<Journal>,
}

impl EventBus {
    /// Wrap a WAL, returning the write handle and the engine's feed.
    pub fn new(wal: Wal) -> (EventBus, EngineFeed) {
        let journal = Arc::new(Journal {
            wal: Mutex::new(wal),
            wake: Notify::new(),
        });
        (
            EventBus {
                journal: Arc::clone(&journal),
            },
            EngineFeed { journal },
        )
    }

    /// Append an event (buffered; durable at the next flush) and wake the
    /// engine. Returns the assigned sequence number.
    pub fn send(&self, event: Event) -> Result<u64, WalError> {
        let seq = self.journal.wal.lock().append(&event)?;
        // notify_one stores a permit when the engine isn't waiting yet.
        self.journal.wake.notify_one();
        Ok(seq)
    }

    /// Flush buffered appends to disk with a single fsync.
    pub fn flush(&self) -> Result<(), WalError> {
        self.journal.wal.lock().flush()
    }

    /// Whether the group-commit window has filled or expired.
    pub fn needs_flush(&self) -> bool {
        self.journal.wal.lock().needs_flush()
    }

    /// Last sequence the engine has processed.
    pub fn processed_seq(&self) -> u64 {
        self.journal.wal.lock().processed_seq()
    }

    /// Highest sequence appended so far.
    pub fn write_seq(&self) -> u64 {
        self.journal.wal.lock().write_seq()
    }
}

impl EngineFeed {
    /// Next entry past the processed watermark, waiting for a writer when
    /// the log is drained.
    pub async fn next(&self) -> Result<WalEntry, WalError> {
        loop {
            if let Some(entry) = self.journal.wal.lock().next_unprocessed()? {
                return Ok(entry);
            }
            self.journal.wake.notified().await;
        }
    }

    /// Advance the processed watermark (persisted via snapshots).
    pub fn mark_processed(&self, seq: u64) {
        self.journal.wal.lock().mark_processed(seq);
    }

    /// Drop entries a durable checkpoint at `seq` has made redundant.
    pub fn compact_through(&self, seq: u64) -> Result<(), WalError> {
        self.journal.wal.lock().truncate_before(seq + 1)
    }
}

/// The durable [`EventSink`]: WAL append + immediate state apply.
pub struct WalSink {
    bus: EventBus,
    state: Arc<Mutex<MaterializedState>>,
}

impl WalSink {
    pub fn new(bus: EventBus, state: Arc<Mutex<MaterializedState>>) -> Self {
        Self { bus, state }
    }
}

impl EventSink for WalSink {
    fn emit(&self, event: Event) -> Result<u64, SchedError> {
        // Append and apply under the state lock: a snapshot that reads
        // (write_seq, state) under the same lock then pairs exactly, so
        // recovery never replays an event the snapshot already contains,
        // nor misses one it doesn't.
        let mut state = self.state.lock();
        let seq = self
            .bus
            .send(event.clone())
            .map_err(|e| SchedError::Storage(e.to_string()))?;
        state.apply_event(&event);
        Ok(seq)
    }
}

#[cfg(test)]
#[path = "event_bus_tests.rs"]
mod tests;
