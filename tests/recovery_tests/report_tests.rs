//! Tests for recovery reports
//!
//! These tests verify:
//! - Recovery on a consistent store is a no-op, twice in a row
//! - Reports land in the audit directory
//! - Stray temporaries and corrupted WAL records are reported

use std::fs;

use statecore::recovery::RecoveryReport;
use statecore::{DigestCheck, Engine, EngineStatus};
use tempfile::TempDir;

use crate::common::{canonical_path, commit_put, config_for, open_ready};

#[test]
fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_ready(&dir);
        commit_put(&engine, "t1", "a", "1");
        commit_put(&engine, "t2", "b", "2");
    }
    let wal_path = dir.path().join("wal").join("wal.log");
    let wal_before = fs::read(&wal_path).unwrap();
    let snap_before = fs::read(canonical_path(&dir)).unwrap();

    let (engine, first) = Engine::open_and_recover(config_for(dir.path())).unwrap();
    let second = engine.recover_from_crash().unwrap();

    assert!(first.is_noop());
    assert!(second.is_noop());
    assert_eq!(first.digest_check, second.digest_check);
    assert_eq!(fs::read(&wal_path).unwrap(), wal_before);
    assert_eq!(fs::read(canonical_path(&dir)).unwrap(), snap_before);
}

#[test]
fn test_second_pass_after_reconciliation_is_noop() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_ready(&dir);
        let mut tx = engine.begin_transaction("dangling").unwrap();
        tx.put("a", "1");
        engine.crash_points().arm(statecore::CrashPoint::AfterTempFlush);
        assert!(engine.commit_transaction(&mut tx).is_err());
    }

    let (engine, first) = Engine::open_and_recover(config_for(dir.path())).unwrap();
    let second = engine.recover_from_crash().unwrap();

    assert!(!first.is_noop());
    assert_eq!(first.rolled_back, 1);
    assert!(second.is_noop(), "{:?}", second);
}

#[test]
fn test_reports_are_written_to_report_dir() {
    let dir = TempDir::new().unwrap();
    let engine = open_ready(&dir);
    engine.recover_from_crash().unwrap();

    let reports: Vec<_> = fs::read_dir(dir.path().join("reports"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(reports.len(), 2);

    for path in reports {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("recovery-") && name.ends_with(".json"));
        let report: RecoveryReport = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(report.digest_check, DigestCheck::NoCommittedState);
    }
    assert_eq!(engine.last_recovery_report().unwrap().rolled_back, 0);
}

#[test]
fn test_stray_temp_is_swept() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_ready(&dir);
        commit_put(&engine, "t1", "a", "1");
    }
    let stray = dir.path().join("snapshots").join("state.snapshot.tmp.00000000000000ff");
    fs::write(&stray, b"leftover").unwrap();

    let (engine, report) = Engine::open_and_recover(config_for(dir.path())).unwrap();

    assert_eq!(report.temp_files_cleaned, 1);
    assert!(!stray.exists());
    assert_eq!(engine.status(), EngineStatus::Ready);
}

#[test]
fn test_corrupted_wal_record_is_reported() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_ready(&dir);
        commit_put(&engine, "t1", "a", "1");
        commit_put(&engine, "t2", "b", "2");
    }
    let wal_path = dir.path().join("wal").join("wal.log");
    let text = fs::read_to_string(&wal_path).unwrap();
    // First record is t1's PREPARE; its COMMIT and t2 follow
    let first_end = text.find('\n').unwrap();
    let damaged = format!("{}{}", text[..first_end].replacen("\"a\"", "\"z\"", 1), &text[first_end..]);
    fs::write(&wal_path, damaged).unwrap();

    let (engine, report) = Engine::open_and_recover(config_for(dir.path())).unwrap();

    assert_eq!(report.wal_entries_corrupted, 1);
    assert!(!report.is_noop());
    assert_eq!(engine.status(), EngineStatus::Ready);
    assert_eq!(engine.get("a").unwrap(), Some(b"1".to_vec()));
}
