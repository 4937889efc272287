//! Tests for TransactionMonitor
//!
//! These tests verify:
//! - Violations reach the sink with the transaction id
//! - Accounting failures never change the commit outcome
//! - Failed bodies roll back

use std::sync::Arc;

use parking_lot::Mutex;
use statecore::config::{Config, SyncMode};
use statecore::cpu::{CpuClock, ThreadCpuAccounting, ThreadHandle};
use statecore::monitor::{ChannelSink, LogSink, TransactionMonitor, ViolationEvent};
use statecore::wal::{Operation, WalReader};
use statecore::{Engine, Result, StateError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Every read advances by `step` ms, so each window measures `step`
struct SteppingClock {
    now: Mutex<f64>,
    step: f64,
}

impl CpuClock for SteppingClock {
    fn thread_cpu_time_ms(&self, _thread: ThreadHandle) -> Result<f64> {
        let mut now = self.now.lock();
        let value = *now;
        *now += self.step;
        Ok(value)
    }

    fn name(&self) -> &'static str {
        "stepping"
    }
}

struct BrokenClock;

impl CpuClock for BrokenClock {
    fn thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64> {
        Err(StateError::ThreadLookupFailure {
            thread: thread.raw(),
            detail: "unavailable".into(),
        })
    }

    fn name(&self) -> &'static str {
        "broken"
    }
}

fn accounting(step: f64) -> Arc<ThreadCpuAccounting> {
    Arc::new(ThreadCpuAccounting::with_clock(Arc::new(SteppingClock {
        now: Mutex::new(0.0),
        step,
    })))
}

fn setup_engine(threshold_ms: f64) -> (TempDir, Arc<Engine>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .sync_mode(SyncMode::Data)
        .cpu_threshold_ms(threshold_ms)
        .build();
    let (engine, _) = Engine::open_and_recover(config).unwrap();
    (temp_dir, Arc::new(engine))
}

// =============================================================================
// Violation Tests
// =============================================================================

#[test]
fn test_violation_is_emitted_to_channel() {
    let (_temp, engine) = setup_engine(50.0);
    let (sink, events) = ChannelSink::new();
    let monitor = TransactionMonitor::with_accounting(engine.clone(), accounting(75.0), Arc::new(sink));

    let result = monitor
        .run("heavy", |tx| {
            tx.put("balance", "90");
            Ok(())
        })
        .unwrap();

    assert_eq!(result.receipt.tx_id, "heavy");
    assert_eq!(result.metrics.as_ref().unwrap().cpu_time_ms, 75.0);
    assert!(result.violation.is_some());

    let event = events.try_recv().unwrap();
    assert_eq!(event.tx_id, "heavy");
    assert_eq!(event.cpu_time_ms, 75.0);
    assert_eq!(event.threshold_ms, 50.0);
    assert_eq!(event.thread_id, ThreadHandle::current().raw());
    assert!(events.try_recv().is_err());

    assert_eq!(engine.get("balance").unwrap(), Some(b"90".to_vec()));
}

#[test]
fn test_light_transaction_emits_nothing() {
    let (_temp, engine) = setup_engine(50.0);
    let (sink, events) = ChannelSink::new();
    let monitor = TransactionMonitor::with_accounting(engine, accounting(5.0), Arc::new(sink));

    let result = monitor.run("light", |tx| {
        tx.put("a", "1");
        Ok(())
    });

    assert!(result.unwrap().violation.is_none());
    assert!(events.try_recv().is_err());
}

#[test]
fn test_closure_sink() {
    let (_temp, engine) = setup_engine(10.0);
    let seen: Arc<Mutex<Vec<ViolationEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink = move |event: ViolationEvent| sink_seen.lock().push(event);
    let monitor = TransactionMonitor::with_accounting(engine, accounting(20.0), Arc::new(sink));

    for i in 0..3 {
        monitor
            .run(format!("t{}", i), |tx| {
                tx.put("k", format!("{}", i));
                Ok(())
            })
            .unwrap();
    }

    let ids: Vec<String> = seen.lock().iter().map(|e| e.tx_id.clone()).collect();
    assert_eq!(ids, vec!["t0", "t1", "t2"]);
}

// =============================================================================
// Failure Isolation Tests
// =============================================================================

#[test]
fn test_broken_clock_does_not_block_commit() {
    let (_temp, engine) = setup_engine(50.0);
    let monitor = TransactionMonitor::with_accounting(
        engine.clone(),
        Arc::new(ThreadCpuAccounting::with_clock(Arc::new(BrokenClock))),
        Arc::new(LogSink),
    );

    let result = monitor
        .run("t1", |tx| {
            tx.put("a", "1");
            Ok(())
        })
        .unwrap();

    assert!(result.metrics.is_none());
    assert!(result.violation.is_none());
    assert_eq!(engine.get("a").unwrap(), Some(b"1".to_vec()));
}

#[test]
fn test_failed_body_rolls_back_and_still_reports() {
    let (_temp, engine) = setup_engine(50.0);
    let (sink, events) = ChannelSink::new();
    let monitor = TransactionMonitor::with_accounting(engine.clone(), accounting(80.0), Arc::new(sink));

    let err = monitor
        .run("bad", |tx| {
            tx.put("a", "1");
            Err(StateError::InvalidTransaction("validation failed".into()))
        })
        .unwrap_err();

    assert!(matches!(err, StateError::InvalidTransaction(_)));
    assert_eq!(engine.get("a").unwrap(), None);
    assert_eq!(events.try_recv().unwrap().tx_id, "bad");

    let entries = WalReader::scan(&engine.wal_path()).unwrap().entries;
    assert_eq!(entries.last().unwrap().op, Operation::Abort);
}

#[test]
fn test_platform_monitor_commits() {
    let (_temp, engine) = setup_engine(10_000.0);
    let monitor = TransactionMonitor::new(engine.clone(), Arc::new(LogSink));

    let result = monitor
        .run("t1", |tx| {
            tx.put("a", "1");
            Ok(())
        })
        .unwrap();

    assert!(result.violation.is_none());
    assert_eq!(engine.get("a").unwrap(), Some(b"1".to_vec()));
}
