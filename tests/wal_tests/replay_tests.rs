//! Tests for log interpretation
//!
//! These tests verify:
//! - Replay applies only committed change-sets
//! - Reset COMMITs replace the state
//! - Pending / last-commit lookups

use std::path::PathBuf;

use statecore::config::SyncMode;
use statecore::snapshot::Digest;
use statecore::wal::{last_commit, pending_transactions, replay, transaction_ids, Change, WalWriter};
use tempfile::TempDir;

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("wal.log");
    (temp_dir, wal_path)
}

#[test]
fn test_replay_skips_uncommitted_and_aborted() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = WalWriter::open(&wal_path, SyncMode::Data).unwrap();

    let p1 = w.append("t1", vec![Change::put("a", b"1".to_vec())]).unwrap();
    w.append("t2", vec![Change::put("b", b"2".to_vec())]).unwrap();
    w.append("t3", vec![Change::put("c", b"3".to_vec())]).unwrap();
    w.mark_committed(&p1, Digest::of(b"1")).unwrap();
    w.append_abort("t3").unwrap();

    let state = replay(&w.scan().unwrap().entries);

    assert_eq!(state.len(), 1);
    assert_eq!(state.get("a"), Some(&b"1".to_vec()));
}

#[test]
fn test_replay_applies_deletes_in_order() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = WalWriter::open(&wal_path, SyncMode::Data).unwrap();

    let p1 = w
        .append("t1", vec![Change::put("a", b"1".to_vec()), Change::put("b", b"2".to_vec())])
        .unwrap();
    w.mark_committed(&p1, Digest::of(b"1")).unwrap();
    let p2 = w
        .append("t2", vec![Change::delete("a"), Change::put("b", b"3".to_vec())])
        .unwrap();
    w.mark_committed(&p2, Digest::of(b"2")).unwrap();

    let state = replay(&w.scan().unwrap().entries);
    assert_eq!(state.get("a"), None);
    assert_eq!(state.get("b"), Some(&b"3".to_vec()));
}

#[test]
fn test_reset_commit_replaces_state() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = WalWriter::open(&wal_path, SyncMode::Data).unwrap();

    let p1 = w.append("t1", vec![Change::put("a", b"1".to_vec())]).unwrap();
    w.mark_committed(&p1, Digest::of(b"1")).unwrap();
    w.append_reset("restore", vec![Change::put("z", b"9".to_vec())], Digest::of(b"r"))
        .unwrap();

    let entries = w.scan().unwrap().entries;
    let state = replay(&entries);
    assert_eq!(state.keys().collect::<Vec<_>>(), vec!["z"]);
    assert_eq!(last_commit(&entries).unwrap().tx_id, "restore");
}

#[test]
fn test_pending_and_ids() {
    let (_temp, wal_path) = setup_temp_wal();
    let mut w = WalWriter::open(&wal_path, SyncMode::Data).unwrap();

    w.append("t2", vec![]).unwrap();
    w.append("t1", vec![]).unwrap();
    w.append_abort("t9").unwrap();

    let entries = w.scan().unwrap().entries;
    let pending: Vec<String> = pending_transactions(&entries)
        .into_iter()
        .map(|e| e.tx_id)
        .collect();

    assert_eq!(pending, vec!["t2", "t1"]);
    assert!(last_commit(&entries).is_none());
    assert_eq!(transaction_ids(&entries).len(), 3);
}
