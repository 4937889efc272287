//! Threshold checks

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, ViolationPolicy};

use super::{ThreadCpuMetrics, ThreadHandle};

/// A window (or run of windows) that used more CPU than allowed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuViolation {
    pub metrics: ThreadCpuMetrics,
    pub threshold_ms: f64,

    /// The value compared against the threshold: the window itself, or the
    /// rolling sum
    pub observed_ms: f64,
}

/// Strictly greater than the threshold is a violation; equal is not.
pub fn check_violation(metrics: &ThreadCpuMetrics, threshold_ms: f64) -> Option<CpuViolation> {
    if metrics.cpu_time_ms > threshold_ms {
        Some(CpuViolation {
            metrics: metrics.clone(),
            threshold_ms,
            observed_ms: metrics.cpu_time_ms,
        })
    } else {
        None
    }
}

/// Rolling windows of one thread lifetime
struct ThreadWindows {
    samples: VecDeque<f64>,
    last_seen: u64,
}

#[derive(Default)]
struct History {
    /// Keyed by (OS thread id, thread instance)
    threads: HashMap<(u64, u64), ThreadWindows>,
    tick: u64,
}

/// Applies a [`ViolationPolicy`] to a stream of measurements
pub struct ViolationDetector {
    threshold_ms: f64,
    policy: ViolationPolicy,
    /// Threads remembered at once; the least recently observed goes first
    thread_capacity: usize,
    /// Recent windows per thread (rolling policy only)
    history: Mutex<History>,
}

impl ViolationDetector {
    pub const DEFAULT_THREAD_CAPACITY: usize = 1024;

    pub fn new(threshold_ms: f64, policy: ViolationPolicy) -> Self {
        Self {
            threshold_ms,
            policy,
            thread_capacity: Self::DEFAULT_THREAD_CAPACITY,
            history: Mutex::new(History::default()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cpu_threshold_ms, config.violation_policy)
    }

    /// Cap the number of threads with rolling history
    pub fn with_thread_capacity(mut self, capacity: usize) -> Self {
        self.thread_capacity = capacity.max(1);
        self
    }

    pub fn threshold_ms(&self) -> f64 {
        self.threshold_ms
    }

    pub fn policy(&self) -> ViolationPolicy {
        self.policy
    }

    /// Threads that currently have rolling history
    pub fn tracked_threads(&self) -> usize {
        self.history.lock().threads.len()
    }

    /// Record a measurement and report a violation if the policy sees one
    pub fn observe(&self, metrics: &ThreadCpuMetrics) -> Option<CpuViolation> {
        match self.policy {
            ViolationPolicy::SingleMeasurement => check_violation(metrics, self.threshold_ms),
            ViolationPolicy::RollingWindow { intervals } => {
                let observed_ms = self.record(metrics, intervals.max(1));

                (observed_ms > self.threshold_ms).then(|| CpuViolation {
                    metrics: metrics.clone(),
                    threshold_ms: self.threshold_ms,
                    observed_ms,
                })
            }
        }
    }

    /// Forget the rolling history of a thread
    pub fn reset(&self, thread: ThreadHandle) {
        self.history
            .lock()
            .threads
            .remove(&(thread.raw(), thread.instance()));
    }

    /// Push a window and return the sum of the last `intervals`
    fn record(&self, metrics: &ThreadCpuMetrics, intervals: usize) -> f64 {
        let mut guard = self.history.lock();
        let history = &mut *guard;
        history.tick += 1;
        let key = (metrics.thread_id, metrics.thread_instance);

        if !history.threads.contains_key(&key) && history.threads.len() >= self.thread_capacity {
            let oldest = history
                .threads
                .iter()
                .min_by_key(|(_, w)| w.last_seen)
                .map(|(k, _)| *k);
            if let Some(oldest) = oldest {
                history.threads.remove(&oldest);
                debug!(thread_id = oldest.0, "dropped rolling CPU history of idle thread");
            }
        }

        let windows = history.threads.entry(key).or_insert_with(|| ThreadWindows {
            samples: VecDeque::with_capacity(intervals),
            last_seen: 0,
        });
        windows.last_seen = history.tick;
        windows.samples.push_back(metrics.cpu_time_ms);
        while windows.samples.len() > intervals {
            windows.samples.pop_front();
        }
        windows.samples.iter().sum()
    }
}
