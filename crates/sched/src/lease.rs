// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-resource-group leader lease with fenced tokens.
//!
//! Exactly one manager replica may schedule a resource group at a time. The
//! lease carries a monotonically increasing fenced token; every accounting
//! write in a cycle is tagged with it, so a deposed leader's writes are
//! rejected even if it never noticed losing the lease.
//!
//! Two backends: `file` puts lease files on shared storage and locks them
//! with `fs2` (the lock dies with the process, the recorded TTL covers hung
//! holders), `memory` is for tests and single-replica deployments.

use crate::error::SchedError;
use berth_core::{Clock, ResourceGroupId};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A held lease on one resource group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub group: ResourceGroupId,
    /// The fenced token: strictly larger than any previous holder's.
    pub token: u64,
}

/// Leader election backend.
pub trait LeaderLease: Send + Sync + 'static {
    /// Try to become leader for a group. `None` means another live holder
    /// has it; try again next cycle.
    fn acquire(&self, group: &ResourceGroupId, ttl: Duration)
        -> Result<Option<Lease>, SchedError>;

    /// Extend a held lease. Returns false when the lease was lost.
    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<bool, SchedError>;

    /// Give the lease up early.
    fn release(&self, lease: Lease) -> Result<(), SchedError>;
}

// ---------------------------------------------------------------------------
// In-memory backend

struct MemorySlot {
    token: u64,
    holder: u64,
    expires_at: Instant,
    held: bool,
}

/// Process-local lease store. Clones share the store; each handle acts as a
/// distinct "replica" for contention tests.
#[derive(Clone)]
pub struct MemoryLease<K: Clock> {
    slots: Arc<Mutex<HashMap<ResourceGroupId, MemorySlot>>>,
    holder_id: u64,
    next_holder: Arc<Mutex<u64>>,
    clock: K,
}

impl<K: Clock> MemoryLease<K> {
    pub fn new(clock: K) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            holder_id: 0,
            next_holder: Arc::new(Mutex::new(1)),
            clock,
        }
    }

    /// Another replica sharing the same lease store.
    pub fn replica(&self) -> Self {
        let mut next = self.next_holder.lock();
        let holder_id = *next;
        *next += 1;
        Self {
            slots: Arc::clone(&self.slots),
            holder_id,
            next_holder: Arc::clone(&self.next_holder),
            clock: self.clock.clone(),
        }
    }
}

impl<K: Clock + 'static> LeaderLease for MemoryLease<K> {
    fn acquire(
        &self,
        group: &ResourceGroupId,
        ttl: Duration,
    ) -> Result<Option<Lease>, SchedError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        let slot = slots.entry(group.clone()).or_insert(MemorySlot {
            token: 0,
            holder: self.holder_id,
            expires_at: now,
            held: false,
        });

        let expired = slot.expires_at <= now;
        if slot.held && !expired && slot.holder != self.holder_id {
            return Ok(None);
        }

        // Re-acquisition by the current holder extends without a new token;
        // takeover (fresh or after expiry) bumps the fence.
        if !(slot.held && !expired && slot.holder == self.holder_id) {
            slot.token += 1;
        }
        slot.holder = self.holder_id;
        slot.expires_at = now + ttl;
        slot.held = true;

        Ok(Some(Lease {
            group: group.clone(),
            token: slot.token,
        }))
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<bool, SchedError> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&lease.group) else {
            return Ok(false);
        };
        if !slot.held || slot.holder != self.holder_id || slot.token != lease.token {
            return Ok(false);
        }
        if slot.expires_at <= now {
            slot.held = false;
            return Ok(false);
        }
        slot.expires_at = now + ttl;
        Ok(true)
    }

    fn release(&self, lease: Lease) -> Result<(), SchedError> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(&lease.group) {
            if slot.holder == self.holder_id && slot.token == lease.token {
                slot.held = false;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File backend

/// On-disk lease record (JSON, one file per group).
#[derive(Debug, Serialize, Deserialize, Default)]
struct LeaseRecord {
    token: u64,
    holder_pid: u32,
    expires_at_epoch_ms: u64,
}

/// Lease files on shared storage, locked with `fs2`.
///
/// The exclusive flock is the real mutual exclusion: it is released by the
/// OS when the holder dies, which covers crash takeover. The TTL in the
/// record is advisory for observability and hung-holder diagnosis.
pub struct FileLease<K: Clock> {
    dir: PathBuf,
    clock: K,
    /// Locked files for leases we currently hold.
    held: Mutex<HashMap<ResourceGroupId, File>>,
}

impl<K: Clock> FileLease<K> {
    pub fn new(dir: PathBuf, clock: K) -> Self {
        Self {
            dir,
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lease_path(&self, group: &ResourceGroupId) -> PathBuf {
        self.dir.join(format!("{group}.lease"))
    }
}

impl<K: Clock + 'static> LeaderLease for FileLease<K> {
    fn acquire(
        &self,
        group: &ResourceGroupId,
        ttl: Duration,
    ) -> Result<Option<Lease>, SchedError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| SchedError::Storage(e.to_string()))?;

        // Already holding it: report the current token.
        {
            let held = self.held.lock();
            if held.contains_key(group) {
                drop(held);
                let record = read_record(&self.lease_path(group))?;
                return Ok(Some(Lease {
                    group: group.clone(),
                    token: record.token,
                }));
            }
        }

        let path = self.lease_path(group);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SchedError::Storage(e.to_string()))?;

        if file.try_lock_exclusive().is_err() {
            // A live process holds the flock.
            return Ok(None);
        }

        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|e| SchedError::Storage(e.to_string()))?;
        let previous: LeaseRecord = serde_json::from_str(&text).unwrap_or_default();

        let record = LeaseRecord {
            token: previous.token + 1,
            holder_pid: std::process::id(),
            expires_at_epoch_ms: self.clock.epoch_ms() + ttl.as_millis() as u64,
        };
        write_record(&mut file, &record)?;

        let token = record.token;
        self.held.lock().insert(group.clone(), file);

        Ok(Some(Lease {
            group: group.clone(),
            token,
        }))
    }

    fn renew(&self, lease: &Lease, ttl: Duration) -> Result<bool, SchedError> {
        let mut held = self.held.lock();
        let Some(file) = held.get_mut(&lease.group) else {
            return Ok(false);
        };
        let record = LeaseRecord {
            token: lease.token,
            holder_pid: std::process::id(),
            expires_at_epoch_ms: self.clock.epoch_ms() + ttl.as_millis() as u64,
        };
        write_record(file, &record)?;
        Ok(true)
    }

    fn release(&self, lease: Lease) -> Result<(), SchedError> {
        // Dropping the file releases the flock.
        self.held.lock().remove(&lease.group);
        Ok(())
    }
}

fn read_record(path: &std::path::Path) -> Result<LeaseRecord, SchedError> {
    let text = std::fs::read_to_string(path).map_err(|e| SchedError::Storage(e.to_string()))?;
    Ok(serde_json::from_str(&text).unwrap_or_default())
}

fn write_record(file: &mut File, record: &LeaseRecord) -> Result<(), SchedError> {
    let json = serde_json::to_vec(record).map_err(|e| SchedError::Storage(e.to_string()))?;
    file.set_len(0).map_err(|e| SchedError::Storage(e.to_string()))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| SchedError::Storage(e.to_string()))?;
    file.write_all(&json)
        .map_err(|e| SchedError::Storage(e.to_string()))?;
    file.sync_all().map_err(|e| SchedError::Storage(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;
