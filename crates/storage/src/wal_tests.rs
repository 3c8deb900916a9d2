// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use berth_core::SessionId;
use std::io::Write as _;

fn touched(n: u64) -> Event {
    Event::SessionTouched {
        id: SessionId::new(format!("s-{n}")),
        at_ms: n,
    }
}

fn wal_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("wal").join("events.wal")
}

#[test]
fn append_assigns_increasing_seqs() {
    let dir = tempfile::tempdir().unwrap();
    let mut wal = Wal::open(&wal_path(&dir), 0).unwrap();

    assert_eq!(wal.append(&touched(1)).unwrap(), 1);
    assert_eq!(wal.append(&touched(2)).unwrap(), 2);
    assert_eq!(wal.write_seq(), 2);
}

#[test]
fn entries_survive_reopen_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let path = wal_path(&dir);

    {
        let mut wal = Wal::open(&path, 0).unwrap();
        wal.append(&touched(1)).unwrap();
        wal.append(&touched(2)).unwrap();
        wal.flush().unwrap();
    }

    let wal = Wal::open(&path, 0).unwrap();
    assert_eq!(wal.write_seq(), 2);
    let entries = wal.entries_after(0).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 1);
    assert_eq!(entries[1].event, touched(2));
}

#[test]
fn next_unprocessed_walks_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut wal = Wal::open(&wal_path(&dir), 0).unwrap();
    wal.append(&touched(1)).unwrap();
    wal.append(&touched(2)).unwrap();

    let first = wal.next_unprocessed().unwrap().unwrap();
    assert_eq!(first.seq, 1);
    wal.mark_processed(first.seq);

    let second = wal.next_unprocessed().unwrap().unwrap();
    assert_eq!(second.seq, 2);
    wal.mark_processed(second.seq);

    assert!(wal.next_unprocessed().unwrap().is_none());
    assert_eq!(wal.processed_seq(), 2);
}

#[test]
fn reopen_resumes_after_processed_seq() {
    let dir = tempfile::tempdir().unwrap();
    let path = wal_path(&dir);

    {
        let mut wal = Wal::open(&path, 0).unwrap();
        for n in 1..=3 {
            wal.append(&touched(n)).unwrap();
        }
        wal.flush().unwrap();
    }

    // Snapshot said we processed up to 2.
    let mut wal = Wal::open(&path, 2).unwrap();
    let next = wal.next_unprocessed().unwrap().unwrap();
    assert_eq!(next.seq, 3);
}

#[test]
fn corrupt_tail_is_rotated_and_prefix_kept() {
    let dir = tempfile::tempdir().unwrap();
    let path = wal_path(&dir);

    {
        let mut wal = Wal::open(&path, 0).unwrap();
        wal.append(&touched(1)).unwrap();
        wal.append(&touched(2)).unwrap();
        wal.flush().unwrap();
    }

    // Simulate a torn write.
    {
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"seq\":3,\"event\":{\"type\":\"sess").unwrap();
    }

    let wal = Wal::open(&path, 0).unwrap();
    assert_eq!(wal.write_seq(), 2);
    assert_eq!(wal.entries_after(0).unwrap().len(), 2);
    assert!(path.with_extension("bak").exists());
}

#[test]
fn truncate_before_drops_old_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = wal_path(&dir);
    let mut wal = Wal::open(&path, 0).unwrap();
    for n in 1..=5 {
        wal.append(&touched(n)).unwrap();
    }
    wal.flush().unwrap();
    wal.mark_processed(5);

    wal.truncate_before(4).unwrap();

    let entries = wal.entries_after(0).unwrap();
    let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, [4, 5]);

    // New appends continue the old numbering.
    assert_eq!(wal.append(&touched(6)).unwrap(), 6);
}

#[test]
fn needs_flush_after_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let mut wal = Wal::open(&wal_path(&dir), 0).unwrap();
    assert!(!wal.needs_flush());
    for n in 0..100 {
        wal.append(&touched(n)).unwrap();
    }
    assert!(wal.needs_flush());
}
