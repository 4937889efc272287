//! Threshold tests with an injected clock
//!
//! These tests verify:
//! - Strict `>` comparison over a grid of synthetic workloads
//! - Rolling window policy
//! - Accounting failures surface as accounting errors

use std::sync::Arc;

use parking_lot::Mutex;
use statecore::config::ViolationPolicy;
use statecore::cpu::{check_violation, CpuClock, ThreadCpuAccounting, ThreadHandle, ViolationDetector};
use statecore::{Result, StateError};

/// Clock that reports whatever the test scripted for the next read
struct ScriptedClock {
    now: Mutex<f64>,
}

impl ScriptedClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(0.0),
        })
    }

    fn advance(&self, ms: f64) {
        *self.now.lock() += ms;
    }
}

impl CpuClock for ScriptedClock {
    fn thread_cpu_time_ms(&self, _thread: ThreadHandle) -> Result<f64> {
        Ok(*self.now.lock())
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

struct FailingClock;

impl CpuClock for FailingClock {
    fn thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64> {
        Err(StateError::ThreadLookupFailure {
            thread: thread.raw(),
            detail: "gone".into(),
        })
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Small deterministic jitter in [0, 1)
fn jitter(seed: &mut u64) -> f64 {
    *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (*seed >> 11) as f64 / (1u64 << 53) as f64
}

#[test]
fn test_threshold_grid_has_no_false_results() {
    let clock = ScriptedClock::new();
    let acc = ThreadCpuAccounting::with_clock(clock.clone());
    let me = ThreadHandle::from_raw(1);
    let mut seed = 42;

    for work_ms in [0.1, 1.0, 10.0, 100.0] {
        let mut violations = 0;
        for _ in 0..1_000 {
            let ctx = acc.start_tracking(me).unwrap();
            // measurement noise of up to 5% of the work
            clock.advance(work_ms * (1.0 + 0.05 * jitter(&mut seed)));
            let metrics = acc.stop_tracking(ctx).unwrap();
            if check_violation(&metrics, 50.0).is_some() {
                violations += 1;
            }
        }
        let expected = if work_ms > 50.0 { 1_000 } else { 0 };
        assert_eq!(violations, expected, "work {} ms", work_ms);
    }
}

#[test]
fn test_exact_threshold_is_not_a_violation() {
    let clock = ScriptedClock::new();
    let acc = ThreadCpuAccounting::with_clock(clock.clone());

    let ctx = acc.start_tracking(ThreadHandle::from_raw(1)).unwrap();
    clock.advance(50.0);
    let metrics = acc.stop_tracking(ctx).unwrap();

    assert!(check_violation(&metrics, 50.0).is_none());
    assert!(check_violation(&metrics, 49.999).is_some());
}

#[test]
fn test_rolling_window_catches_sustained_load() {
    let clock = ScriptedClock::new();
    let acc = ThreadCpuAccounting::with_clock(clock.clone());
    let detector = ViolationDetector::new(50.0, ViolationPolicy::RollingWindow { intervals: 4 });
    let me = ThreadHandle::from_raw(3);

    let mut flagged = Vec::new();
    for _ in 0..6 {
        let ctx = acc.start_tracking(me).unwrap();
        clock.advance(15.0);
        let metrics = acc.stop_tracking(ctx).unwrap();
        flagged.push(detector.observe(&metrics).map(|v| v.observed_ms));
    }

    // 15, 30, 45 stay under; 60 from the fourth window on
    assert_eq!(flagged, vec![None, None, None, Some(60.0), Some(60.0), Some(60.0)]);
}

#[test]
fn test_lookup_failure_is_an_accounting_error() {
    let acc = ThreadCpuAccounting::with_clock(Arc::new(FailingClock));

    let err = acc.start_tracking(ThreadHandle::from_raw(9)).unwrap_err();

    assert!(err.is_accounting_failure());
    assert!(!err.is_integrity_failure());
    assert_eq!(acc.active_threads(), 0);
}
