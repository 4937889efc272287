//! Tests for WAL compaction
//!
//! These tests verify:
//! - One record per transaction survives
//! - Replay gives the same state before and after
//! - Appends continue after compaction

use std::fs;
use std::path::PathBuf;

use statecore::config::SyncMode;
use statecore::snapshot::Digest;
use statecore::wal::{replay, Change, Operation, WalReader, WalWriter};
use statecore::StateError;
use tempfile::TempDir;

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("wal.log");
    (temp_dir, wal_path)
}

fn populated(path: &PathBuf) -> WalWriter {
    let mut w = WalWriter::open(path, SyncMode::Data).unwrap();
    for i in 0..10 {
        let id = format!("t{}", i);
        let p = w
            .append(&id, vec![Change::put(format!("k{}", i % 3), vec![i as u8])])
            .unwrap();
        if i % 4 == 3 {
            w.append_abort(&id).unwrap();
        } else {
            w.mark_committed(&p, Digest::of(&[i as u8])).unwrap();
        }
    }
    w.append("open", vec![Change::put("x", b"x".to_vec())]).unwrap();
    w
}

#[test]
fn test_compaction_keeps_latest_status_per_tx() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = populated(&wal_path);

    let stats = w.compact().unwrap();
    let entries = WalReader::scan(&wal_path).unwrap().entries;

    assert_eq!(stats.entries_before, 21);
    assert_eq!(stats.entries_after, 11);
    assert_eq!(stats.entries_removed(), 10);
    assert_eq!(entries.len(), 11);
    assert!(stats.bytes_after < stats.bytes_before);
    assert_eq!(entries.last().unwrap().op, Operation::Prepare);
}

#[test]
fn test_compaction_preserves_replayed_state() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = populated(&wal_path);
    let before = replay(&WalReader::scan(&wal_path).unwrap().entries);

    w.compact().unwrap();

    let after = replay(&WalReader::scan(&wal_path).unwrap().entries);
    assert_eq!(before, after);
    assert!(!before.is_empty());
}

#[test]
fn test_append_after_compaction() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = populated(&wal_path);
    let next = w.current_lsn();

    w.compact().unwrap();
    let e = w.append("late", vec![]).unwrap();

    assert_eq!(e.lsn, next);
    assert_eq!(w.offset(), fs::metadata(&wal_path).unwrap().len());
    let entries = WalReader::scan(&wal_path).unwrap().entries;
    assert_eq!(entries.last().unwrap().tx_id, "late");
}

#[test]
fn test_appends_across_compactions_survive_reopen() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = populated(&wal_path);

    w.compact().unwrap();
    w.append_abort("open").unwrap();
    w.compact().unwrap();
    let e = w.append("late", vec![Change::put("y", b"y".to_vec())]).unwrap();
    w.mark_committed(&e, Digest::of(b"y")).unwrap();
    drop(w);

    let w = WalWriter::open(&wal_path, SyncMode::Data).unwrap();
    let entries = WalReader::scan(&wal_path).unwrap().entries;
    assert_eq!(w.offset(), fs::metadata(&wal_path).unwrap().len());
    assert_eq!(entries.last().unwrap().tx_id, "late");
    assert_eq!(entries.last().unwrap().op, Operation::Commit);
    assert_eq!(replay(&entries).get("y"), Some(&b"y".to_vec()));
    assert!(!wal_path.with_extension("log.compact").exists());
}

#[test]
fn test_failed_compaction_keeps_writing_the_old_log() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = populated(&wal_path);
    // Occupy the compaction target so it cannot be created
    fs::create_dir(wal_path.with_extension("log.compact")).unwrap();

    assert!(w.compact().is_err());
    w.append("late", vec![]).unwrap();

    let entries = WalReader::scan(&wal_path).unwrap().entries;
    assert_eq!(entries.len(), 22);
    assert_eq!(entries.last().unwrap().tx_id, "late");
}

#[test]
fn test_compaction_refuses_corrupted_log() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = populated(&wal_path);
    let text = fs::read_to_string(&wal_path).unwrap();
    fs::write(&wal_path, text.replacen("\"tx_id\":\"t1\"", "\"tx_id\":\"tZ\"", 1)).unwrap();

    assert!(matches!(w.compact(), Err(StateError::WalCorruption(_))));
}
