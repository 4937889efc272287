//! Tests for atomicity under crash
//!
//! These tests verify:
//! - A crash at every protocol point leaves a prefix of completed commits
//! - Interrupted transactions are reconciled to ABORT
//! - Temporaries never survive recovery
//! - A real process abort behaves like the in-process crash

use std::process::Command;

use statecore::crash_point::CRASH_POINT_ENV;
use statecore::memtable::State;
use statecore::snapshot::state_digest;
use statecore::wal::{Operation, WalReader};
use statecore::{CrashPoint, Engine, EngineStatus, StateError};
use tempfile::TempDir;

use crate::common::{commit_put, config_for, open_ready, store};

const COMMITS: usize = 4;

/// Commit `COMMITS` transactions, crashing at `point` during commit number
/// `crash_at`. Returns the state after each completed commit, starting
/// with the empty state.
fn run_until_crash(dir: &TempDir, crash_at: usize, point: CrashPoint) -> Vec<State> {
    let engine = open_ready(dir);
    let mut states = vec![State::new()];

    for i in 0..COMMITS {
        if i == crash_at {
            engine.crash_points().arm(point);
        }
        let mut tx = engine.begin_transaction(format!("t{}", i)).unwrap();
        tx.put("balance", format!("{}", 100 - i * 10));
        tx.put(format!("k{}", i), "x");
        if i > 0 {
            tx.delete(format!("k{}", i - 1));
        }

        match engine.commit_transaction(&mut tx) {
            Ok(_) => states.push(engine.state().unwrap()),
            Err(StateError::SimulatedCrash(name)) => {
                assert_eq!(i, crash_at);
                assert_eq!(name, point.name());
                // The staged state is what a completed commit would have shown
                let mut completed = states.last().unwrap().clone();
                completed.insert("balance".into(), format!("{}", 100 - i * 10).into_bytes());
                completed.insert(format!("k{}", i), b"x".to_vec());
                if i > 0 {
                    completed.remove(&format!("k{}", i - 1));
                }
                states.push(completed);
                break;
            }
            Err(e) => panic!("unexpected commit error: {}", e),
        }
    }
    states
}

#[test]
fn test_crash_at_every_point_recovers_a_committed_prefix() {
    for &point in CrashPoint::all() {
        for crash_at in 0..COMMITS {
            let dir = TempDir::new().unwrap();
            let states = run_until_crash(&dir, crash_at, point);

            let (engine, report) = Engine::open_and_recover(config_for(dir.path())).unwrap();
            assert_eq!(engine.status(), EngineStatus::Ready, "{:?} at {}", point, crash_at);

            let survived = match point {
                CrashPoint::AfterCommit => crash_at + 1,
                _ => crash_at,
            };
            let expected = &states[survived];
            assert_eq!(&engine.state().unwrap(), expected, "{:?} at {}", point, crash_at);
            assert_eq!(
                engine.snapshot_digest().unwrap(),
                state_digest(expected).unwrap()
            );

            assert!(engine.list_uncommitted().unwrap().is_empty());
            assert!(store(&engine).temp_files().unwrap().is_empty());
            assert!(report.is_clean());

            let crashed_tx = format!("t{}", crash_at);
            let last = WalReader::scan(&engine.wal_path())
                .unwrap()
                .entries
                .into_iter()
                .filter(|e| e.tx_id == crashed_tx)
                .last();
            match point {
                CrashPoint::BeforePrepare => assert!(last.is_none()),
                CrashPoint::AfterCommit => assert_eq!(last.unwrap().op, Operation::Commit),
                _ => assert_eq!(last.unwrap().op, Operation::Abort),
            }

            if point == CrashPoint::AfterRename {
                assert_eq!(report.publications_undone, 1);
            }
        }
    }
}

/// Balance 100 → 90, killed while the temporary snapshot is being flushed
#[test]
fn test_crash_during_temp_flush_keeps_old_balance() {
    let dir = TempDir::new().unwrap();
    {
        let engine = open_ready(&dir);
        commit_put(&engine, "open", "balance", "100");

        engine.crash_points().arm(CrashPoint::BeforeTempFlush);
        let mut tx = engine.begin_transaction("A").unwrap();
        tx.put("balance", "90");
        assert!(engine.commit_transaction(&mut tx).is_err());
        assert!(!store(&engine).temp_files().unwrap().is_empty());
    }

    let (engine, report) = Engine::open_and_recover(config_for(dir.path())).unwrap();

    assert_eq!(engine.get("balance").unwrap(), Some(b"100".to_vec()));
    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.temp_files_cleaned, 1);
    let entries = WalReader::scan(&engine.wal_path()).unwrap().entries;
    let a = entries.iter().filter(|e| e.tx_id == "A").last().unwrap();
    assert_eq!(a.op, Operation::Abort);
}

#[test]
fn test_recovered_store_accepts_new_commits() {
    let dir = TempDir::new().unwrap();
    run_until_crash(&dir, 2, CrashPoint::AfterRename);

    let engine = open_ready(&dir);
    commit_put(&engine, "t-next", "balance", "1");

    let engine_again = {
        drop(engine);
        open_ready(&dir)
    };
    assert_eq!(engine_again.get("balance").unwrap(), Some(b"1".to_vec()));
}

// =============================================================================
// Real process abort
// =============================================================================

const CHILD_DIR_ENV: &str = "STATECORE_TEST_CHILD_DIR";

/// Runs only as a child of `test_process_abort_mid_commit`
#[test]
#[ignore]
fn crash_child_commit() {
    let dir = match std::env::var(CHILD_DIR_ENV) {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let (engine, _) =
        Engine::open_and_recover(config_for(std::path::Path::new(&dir))).unwrap();
    let mut tx = engine.begin_transaction("child").unwrap();
    tx.put("balance", "90");
    let _ = engine.commit_transaction(&mut tx);
}

#[test]
fn test_process_abort_mid_commit() {
    let exe = std::env::current_exe().unwrap();

    for point in [
        CrashPoint::AfterPrepare,
        CrashPoint::AfterTempFlush,
        CrashPoint::AfterRename,
    ] {
        let dir = TempDir::new().unwrap();
        {
            let engine = open_ready(&dir);
            commit_put(&engine, "open", "balance", "100");
        }

        let status = Command::new(&exe)
            .args(["crash_tests::crash_child_commit", "--exact", "--ignored", "--nocapture"])
            .env(CRASH_POINT_ENV, point.name())
            .env(CHILD_DIR_ENV, dir.path())
            .status()
            .unwrap();
        assert!(!status.success(), "child should abort at {:?}", point);

        let (engine, report) = Engine::open_and_recover(config_for(dir.path())).unwrap();
        assert_eq!(engine.get("balance").unwrap(), Some(b"100".to_vec()), "{:?}", point);
        assert_eq!(report.rolled_back, 1);
    }
}
