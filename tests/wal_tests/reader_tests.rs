//! Tests for WAL Reader
//!
//! These tests verify:
//! - Reading entries written by the writer
//! - Iterator support
//! - Torn tails and mid-log corruption

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use statecore::config::SyncMode;
use statecore::wal::{Change, WalReader, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_wal() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let wal_path = temp_dir.path().join("wal.log");
    (temp_dir, wal_path)
}

fn write_prepares(path: &PathBuf, ids: &[&str]) {
    let mut writer = WalWriter::open(path, SyncMode::Data).unwrap();
    for id in ids {
        writer
            .append(id, vec![Change::put(*id, id.as_bytes().to_vec())])
            .unwrap();
    }
}

// =============================================================================
// Basic Reading Tests
// =============================================================================

#[test]
fn test_scan_missing_file_is_empty() {
    let (_temp, wal_path) = setup_temp_wal();
    let scan = WalReader::scan(&wal_path).unwrap();
    assert!(scan.entries.is_empty());
    assert_eq!(scan.stats.entries_read, 0);
}

#[test]
fn test_scan_reads_in_order() {
    let (_temp, wal_path) = setup_temp_wal();
    write_prepares(&wal_path, &["t1", "t2", "t3"]);

    let scan = WalReader::scan(&wal_path).unwrap();
    let ids: Vec<&str> = scan.entries.iter().map(|e| e.tx_id.as_str()).collect();

    assert_eq!(ids, vec!["t1", "t2", "t3"]);
    assert_eq!(scan.stats.entries_read, 3);
    assert_eq!(scan.stats.last_lsn, 3);
    assert_eq!(scan.stats.valid_len, fs::metadata(&wal_path).unwrap().len());
}

#[test]
fn test_offsets_point_at_each_record() {
    let (_temp, wal_path) = setup_temp_wal();
    write_prepares(&wal_path, &["t1", "t2"]);

    let text = fs::read_to_string(&wal_path).unwrap();
    let scan = WalReader::scan(&wal_path).unwrap();
    for entry in &scan.entries {
        assert!(text[entry.offset as usize..].starts_with("{\"crc\":"));
    }
}

// =============================================================================
// Iterator Tests
// =============================================================================

#[test]
fn test_iterator_for_loop() {
    let (_temp, wal_path) = setup_temp_wal();
    write_prepares(&wal_path, &["a", "b"]);

    let mut lsns = Vec::new();
    for entry in WalReader::open(&wal_path).unwrap().entries() {
        lsns.push(entry.unwrap().lsn);
    }
    assert_eq!(lsns, vec![1, 2]);
}

// =============================================================================
// Damage Tests
// =============================================================================

#[test]
fn test_torn_tail_ends_scan() {
    let (_temp, wal_path) = setup_temp_wal();
    write_prepares(&wal_path, &["t1"]);
    let good_len = fs::metadata(&wal_path).unwrap().len();
    OpenOptions::new()
        .append(true)
        .open(&wal_path)
        .unwrap()
        .write_all(b"{\"crc\":1")
        .unwrap();

    let scan = WalReader::scan(&wal_path).unwrap();

    assert_eq!(scan.entries.len(), 1);
    assert!(scan.stats.was_truncated);
    assert_eq!(scan.stats.valid_len, good_len);
    assert_eq!(scan.stats.entries_corrupted, 0);
}

#[test]
fn test_mid_log_corruption_is_skipped_and_counted() {
    let (_temp, wal_path) = setup_temp_wal();
    write_prepares(&wal_path, &["t1", "t2", "t3"]);

    let text = fs::read_to_string(&wal_path).unwrap();
    fs::write(&wal_path, text.replace("\"tx_id\":\"t2\"", "\"tx_id\":\"tX\"")).unwrap();

    let scan = WalReader::scan(&wal_path).unwrap();
    let ids: Vec<&str> = scan.entries.iter().map(|e| e.tx_id.as_str()).collect();

    assert_eq!(ids, vec!["t1", "t3"]);
    assert_eq!(scan.stats.entries_corrupted, 1);
    assert!(!scan.stats.was_truncated);
}

#[test]
fn test_garbage_final_line_counts_as_torn() {
    let (_temp, wal_path) = setup_temp_wal();
    write_prepares(&wal_path, &["t1"]);
    OpenOptions::new()
        .append(true)
        .open(&wal_path)
        .unwrap()
        .write_all(b"not json\n")
        .unwrap();

    let scan = WalReader::scan(&wal_path).unwrap();
    assert_eq!(scan.entries.len(), 1);
    assert!(scan.stats.was_truncated);
}
