// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! JSONL event write-ahead log with group commit.
//!
//! Events are durably stored before processing, enabling crash recovery via
//! snapshot + replay. Group commit batches writes (~10ms) so a burst of
//! heartbeats costs one fsync.
//!
//! Each entry is a single line of JSON: `{"seq":N,"event":{...}}\n`

use berth_core::Event;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Flush interval for group commit (~10ms batches)
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Maximum entries to buffer before forcing flush
const FLUSH_THRESHOLD: usize = 100;

/// Errors that can occur in Wal operations
#[derive(Debug, Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialization helper for writing WAL entries without cloning the event.
#[derive(Serialize)]
struct WalRecordRef<'a> {
    seq: u64,
    event: &'a Event,
}

/// Deserialization helper for reading WAL entries.
#[derive(Deserialize)]
struct WalRecord {
    seq: u64,
    event: Event,
}

/// A single WAL entry with its global sequence number.
#[derive(Debug, Clone)]
pub struct WalEntry {
    pub seq: u64,
    pub event: Event,
}

/// Outcome of scanning the log file at open.
struct ScanResult {
    /// Highest sequence number present.
    max_seq: u64,
    /// Byte offset of the first entry after `processed_seq`.
    read_offset: u64,
    /// True when a line failed to parse (torn tail or corruption).
    corrupt: bool,
    /// Raw lines that parsed, in order, up to the corruption point.
    valid_lines: Vec<String>,
}

/// JSONL WAL for durable event storage with group commit.
///
/// Events are buffered in memory and flushed to disk either when
/// `needs_flush()` reports the interval elapsed / buffer full, or explicitly
/// via `flush()`. The WAL tracks both the write sequence (highest seq
/// written) and processed sequence (highest seq the engine has applied).
pub struct Wal {
    file: File,
    /// Persistent read handle (cloned once at open) for `next_unprocessed`.
    read_file: File,
    path: PathBuf,
    /// Next sequence number to assign
    write_seq: u64,
    /// Sequence number of last processed entry
    processed_seq: u64,
    /// Buffered JSON lines waiting to be flushed (without trailing newline)
    write_buffer: Vec<Vec<u8>>,
    /// Last flush timestamp for interval checking
    last_flush: Instant,
    /// Current read position for `next_unprocessed`
    read_offset: u64,
}

impl Wal {
    /// Open or create a WAL at the given path.
    ///
    /// `processed_seq` comes from the snapshot (0 without one). A torn or
    /// corrupt tail is rotated to a `.bak` file and the parseable prefix is
    /// rewritten in place, so recovery never replays garbage.
    pub fn open(path: &Path, processed_seq: u64) -> Result<Self, WalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = Self::open_log(path)?;
        let mut scan = Self::scan(&file, processed_seq)?;

        if scan.corrupt {
            drop(file);
            let bak_path = crate::snapshot::retire_to_bak(path)?;
            warn!(
                path = %path.display(),
                bak = %bak_path.display(),
                valid_entries = scan.valid_lines.len(),
                "corrupt WAL tail retired to .bak, keeping the valid prefix",
            );

            {
                let mut clean = File::create(path)?;
                for line in &scan.valid_lines {
                    clean.write_all(line.as_bytes())?;
                    clean.write_all(b"\n")?;
                }
                clean.sync_all()?;
            }

            file = Self::open_log(path)?;
            scan = Self::scan(&file, processed_seq)?;
        }

        let read_file = file.try_clone()?;

        Ok(Self {
            file,
            read_file,
            path: path.to_owned(),
            write_seq: scan.max_seq,
            processed_seq,
            write_buffer: Vec::new(),
            last_flush: Instant::now(),
            read_offset: scan.read_offset,
        })
    }

    fn open_log(path: &Path) -> Result<File, WalError> {
        Ok(OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?)
    }

    /// Walk the whole file once, collecting sequence bounds, the resume
    /// offset for `processed_seq`, and the parseable prefix.
    fn scan(file: &File, processed_seq: u64) -> Result<ScanResult, WalError> {
        let mut reader = BufReader::new(file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;

        let mut out = ScanResult {
            max_seq: 0,
            read_offset: 0,
            corrupt: false,
            valid_lines: Vec::new(),
        };
        let mut offset = 0u64;
        let mut resume_found = false;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    out.corrupt = true;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                offset += bytes_read as u64;
                continue;
            }

            let record: WalRecord = match serde_json::from_str(trimmed) {
                Ok(r) => r,
                Err(_) => {
                    out.corrupt = true;
                    break;
                }
            };

            out.max_seq = out.max_seq.max(record.seq);
            if record.seq > processed_seq && !resume_found {
                out.read_offset = offset;
                resume_found = true;
            }
            out.valid_lines.push(trimmed.to_string());
            offset += bytes_read as u64;
        }

        if !resume_found {
            out.read_offset = offset;
        }

        Ok(out)
    }

    /// Append an event to the write buffer.
    ///
    /// Returns the assigned sequence number. The event is NOT durable until
    /// `flush()` is called.
    pub fn append(&mut self, event: &Event) -> Result<u64, WalError> {
        self.write_seq += 1;
        let seq = self.write_seq;
        let record = WalRecordRef { seq, event };
        self.write_buffer.push(serde_json::to_vec(&record)?);
        Ok(seq)
    }

    /// Check if flush is needed (interval elapsed or buffer full).
    pub fn needs_flush(&self) -> bool {
        !self.write_buffer.is_empty()
            && (self.last_flush.elapsed() >= FLUSH_INTERVAL
                || self.write_buffer.len() >= FLUSH_THRESHOLD)
    }

    /// Flush all buffered entries to disk with a single fsync.
    ///
    /// This is the durability point: after flush returns, every buffered
    /// event is on disk.
    pub fn flush(&mut self) -> Result<(), WalError> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        for mut json_bytes in self.write_buffer.drain(..) {
            json_bytes.push(b'\n');
            self.file.write_all(&json_bytes)?;
        }

        self.file.sync_all()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Get the next unprocessed entry from the WAL.
    ///
    /// Returns `None` if all entries have been processed or none exist.
    pub fn next_unprocessed(&mut self) -> Result<Option<WalEntry>, WalError> {
        // Flush pending writes first so they're readable
        self.flush()?;

        let mut reader = BufReader::new(&self.read_file);
        reader.seek(SeekFrom::Start(self.read_offset))?;

        let mut line = String::new();
        let bytes_read = match reader.read_line(&mut line) {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let record: WalRecord = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    offset = self.read_offset,
                    error = %e,
                    "corrupt WAL entry, skipping",
                );
                // Advance past the corrupt line to avoid getting stuck
                self.read_offset += bytes_read as u64;
                return Ok(None);
            }
        };

        self.read_offset += bytes_read as u64;

        Ok(Some(WalEntry {
            seq: record.seq,
            event: record.event,
        }))
    }

    /// Mark an entry as processed.
    ///
    /// Updates the in-memory processed_seq; persistence happens via snapshots.
    pub fn mark_processed(&mut self, seq: u64) {
        self.processed_seq = seq;
    }

    pub fn processed_seq(&self) -> u64 {
        self.processed_seq
    }

    pub fn write_seq(&self) -> u64 {
        self.write_seq
    }

    /// Iterate over all entries after the given sequence number.
    ///
    /// Used for recovery (replaying from snapshot).
    pub fn entries_after(&self, seq: u64) -> Result<Vec<WalEntry>, WalError> {
        let scan = Self::scan(&self.file, seq)?;
        let mut entries = Vec::new();
        for line in &scan.valid_lines {
            let record: WalRecord = serde_json::from_str(line)?;
            if record.seq > seq {
                entries.push(WalEntry {
                    seq: record.seq,
                    event: record.event,
                });
            }
        }
        Ok(entries)
    }

    /// Drop entries before the given sequence number.
    ///
    /// Called after a checkpoint is durable, to reclaim disk space. Rewrites
    /// the file atomically via a temp file.
    pub fn truncate_before(&mut self, seq: u64) -> Result<(), WalError> {
        self.flush()?;

        let scan = Self::scan(&self.file, self.processed_seq)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut new_read_offset = 0u64;
        {
            let mut tmp = File::create(&tmp_path)?;
            let mut offset = 0u64;
            let mut resume_found = false;

            for line in &scan.valid_lines {
                let record: WalRecord = serde_json::from_str(line)?;
                if record.seq < seq {
                    continue;
                }
                if record.seq > self.processed_seq && !resume_found {
                    new_read_offset = offset;
                    resume_found = true;
                }
                tmp.write_all(line.as_bytes())?;
                tmp.write_all(b"\n")?;
                offset += line.len() as u64 + 1;
            }
            if !resume_found {
                new_read_offset = offset;
            }
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        self.file = Self::open_log(&self.path)?;
        self.read_file = self.file.try_clone()?;
        self.read_offset = new_read_offset;

        Ok(())
    }
}

#[cfg(test)]
#[path = "wal_tests.rs"]
mod tests;
