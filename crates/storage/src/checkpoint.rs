// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background checkpointing with zstd compression and durable fsync.
//!
//! The checkpointer runs I/O off the engine loop while keeping the crash
//! recovery invariant: the snapshot must be durable (including directory
//! fsync) before the WAL is truncated.

use crate::{MaterializedState, Snapshot, SnapshotError};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Errors from checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compress(String),
    #[error("checkpoint failed: {0}")]
    Failed(String),
}

/// Result of a completed checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointResult {
    /// Sequence number that was checkpointed
    pub seq: u64,
    /// Size of the compressed snapshot in bytes
    pub size_bytes: u64,
}

/// Handle to a running checkpoint operation.
///
/// The checkpoint runs in a background thread. Call `wait()` to block until
/// completion, which must happen before WAL truncation.
pub struct CheckpointHandle {
    /// Sequence number being checkpointed
    pub seq: u64,
    receiver: mpsc::Receiver<Result<CheckpointResult, CheckpointError>>,
    // NOTE(lifetime): keep thread alive
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

impl CheckpointHandle {
    /// Wait for the checkpoint to complete.
    ///
    /// Blocks until the snapshot is fully durable (including directory
    /// fsync). Only after this returns successfully is WAL truncation safe.
    pub fn wait(self) -> Result<CheckpointResult, CheckpointError> {
        self.receiver
            .recv()
            .map_err(|_| CheckpointError::Failed("checkpoint thread panicked".into()))?
    }

    /// Check if checkpoint is complete without blocking.
    pub fn try_wait(&self) -> Option<Result<CheckpointResult, CheckpointError>> {
        self.receiver.try_recv().ok()
    }
}

/// Checkpointer manages background snapshot operations.
pub struct Checkpointer {
    snapshot_path: PathBuf,
    compression_level: i32,
}

impl Checkpointer {
    pub fn new(snapshot_path: PathBuf) -> Self {
        Self {
            snapshot_path,
            // zstd level 3 balances speed and ratio
            compression_level: 3,
        }
    }

    /// Start a background checkpoint.
    ///
    /// Clones the state and spawns a thread to serialize, compress, and
    /// write the snapshot. The returned handle must be waited on before
    /// truncating the WAL.
    pub fn start(&self, seq: u64, state: &MaterializedState) -> CheckpointHandle {
        let state_clone = state.clone();
        let snapshot_path = self.snapshot_path.clone();
        let compression_level = self.compression_level;

        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let result = checkpoint_blocking(seq, &state_clone, &snapshot_path, compression_level);
            let _ = tx.send(result);
        });

        CheckpointHandle {
            seq,
            receiver: rx,
            handle,
        }
    }

    /// Perform a synchronous checkpoint (for shutdown).
    pub fn checkpoint_sync(
        &self,
        seq: u64,
        state: &MaterializedState,
    ) -> Result<CheckpointResult, CheckpointError> {
        checkpoint_blocking(seq, state, &self.snapshot_path, self.compression_level)
    }
}

/// Perform checkpoint I/O (runs on the background thread).
///
/// Ordering is load-bearing: tmp write, tmp fsync, rename, directory fsync.
fn checkpoint_blocking(
    seq: u64,
    state: &MaterializedState,
    snapshot_path: &Path,
    compression_level: i32,
) -> Result<CheckpointResult, CheckpointError> {
    let tmp_path = snapshot_path.with_extension("tmp");

    let snapshot = Snapshot::new(seq, state.clone());
    let json_bytes = serde_json::to_vec(&snapshot)?;
    let compressed = zstd::encode_all(json_bytes.as_slice(), compression_level)
        .map_err(|e| CheckpointError::Compress(e.to_string()))?;

    if let Some(parent) = tmp_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&compressed)?;
        file.sync_all()?;
    }

    std::fs::rename(&tmp_path, snapshot_path)?;

    if let Some(parent) = snapshot_path.parent() {
        File::open(parent)?.sync_all()?;
    }

    let size_bytes = std::fs::metadata(snapshot_path)
        .map(|m| m.len())
        .unwrap_or(compressed.len() as u64);

    Ok(CheckpointResult { seq, size_bytes })
}

/// Load a zstd-compressed snapshot.
///
/// Mirrors [`Snapshot::load`]'s recovery posture: a missing file is
/// `Ok(None)`, an undecodable one is retired to the `.bak` rotation and
/// recovery falls back to WAL replay, and a version from a newer build is
/// a hard error.
pub fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, SnapshotError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let decoded = zstd::stream::read::Decoder::new(file)
        .map_err(|e| std::io::Error::other(e.to_string()))
        .and_then(|decoder| {
            serde_json::from_reader::<_, Snapshot>(decoder)
                .map_err(|e| std::io::Error::other(e.to_string()))
        });

    match decoded {
        Ok(snapshot) => {
            snapshot.check_version()?;
            Ok(Some(snapshot))
        }
        Err(decode_error) => {
            let retired = crate::snapshot::retire_to_bak(path)?;
            tracing::warn!(
                error = %decode_error,
                path = %path.display(),
                retired = %retired.display(),
                "unreadable checkpoint retired, recovering from WAL replay",
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod tests;
