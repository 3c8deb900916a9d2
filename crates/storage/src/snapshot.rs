// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot persistence for crash recovery.
//!
//! A snapshot is the complete materialized state as of one WAL sequence
//! number; recovery loads it and replays only the WAL entries after that
//! sequence. Unreadable snapshot files are retired to rotating `.bak`
//! slots so a bad write degrades to a slower WAL-only recovery instead of
//! a refused startup. A snapshot tagged with a version newer than this
//! build understands is a hard error: silently ignoring it would replay a
//! WAL tail against the wrong base state.

use crate::MaterializedState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Snapshot schema version written by this build.
pub const CURRENT_SNAPSHOT_VERSION: u32 = 1;

/// How many retired snapshot copies to keep for postmortems.
const KEEP_RETIRED: u32 = 3;

/// Errors that can occur in snapshot operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot version {0} is newer than this build supports ({1})")]
    TooNew(u32, u32),
}

/// The materialized state as of WAL sequence `seq`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema version; loads refuse anything newer than this build writes.
    #[serde(default = "default_version", rename = "v")]
    pub version: u32,
    /// WAL sequence number the state includes up to.
    pub seq: u64,
    pub state: MaterializedState,
    pub created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Snapshot {
    pub fn new(seq: u64, state: MaterializedState) -> Self {
        Self {
            version: CURRENT_SNAPSHOT_VERSION,
            seq,
            state,
            created_at: Utc::now(),
        }
    }

    /// Refuse snapshots written by a newer build.
    pub fn check_version(&self) -> Result<(), SnapshotError> {
        if self.version > CURRENT_SNAPSHOT_VERSION {
            return Err(SnapshotError::TooNew(self.version, CURRENT_SNAPSHOT_VERSION));
        }
        Ok(())
    }

    /// Save atomically: serialize to a staging file, fsync, rename. A crash
    /// mid-save can never clobber the previous snapshot.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staging = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(fs::File::create(&staging)?);
            serde_json::to_writer(&mut writer, self)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        fs::rename(&staging, path)?;

        Ok(())
    }

    /// Load the snapshot if one exists.
    ///
    /// `Ok(None)` when the file is absent, and also when it fails to parse;
    /// the broken file is retired first so recovery proceeds via WAL replay.
    /// A version from the future propagates as [`SnapshotError::TooNew`].
    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_reader::<_, Snapshot>(BufReader::new(file)) {
            Ok(snapshot) => {
                snapshot.check_version()?;
                Ok(Some(snapshot))
            }
            Err(parse_error) => {
                let retired = retire_to_bak(path)?;
                warn!(
                    error = %parse_error,
                    path = %path.display(),
                    retired = %retired.display(),
                    "unreadable snapshot retired, recovering from WAL replay",
                );
                Ok(None)
            }
        }
    }
}

/// Move a broken file into the `.bak` rotation and return where it went.
///
/// Keeps [`KEEP_RETIRED`] copies: the newest lands in `.bak`, older ones
/// shift to `.bak.2`, `.bak.3`, and the eldest is dropped.
pub(crate) fn retire_to_bak(path: &Path) -> Result<PathBuf, std::io::Error> {
    let slot = |n: u32| match n {
        1 => path.with_extension("bak"),
        n => path.with_extension(format!("bak.{n}")),
    };

    let _ = fs::remove_file(slot(KEEP_RETIRED));
    for n in (2..=KEEP_RETIRED).rev() {
        let younger = slot(n - 1);
        if younger.exists() {
            let _ = fs::rename(&younger, slot(n));
        }
    }

    let retired = slot(1);
    fs::rename(path, &retired)?;
    Ok(retired)
}

#[cfg(test)]
#[path = "snapshot_tests.rs"]
mod tests;
