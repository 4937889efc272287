//! Tracking windows
//!
//! The accounting registry owns every live window in one arena keyed by
//! thread handle. Contexts handed to callers are receipts into that arena.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::wal::now_millis;

use super::platform::{lookup_failure, probe, CpuClock};
use super::ThreadHandle;

/// A live tracking window, consumed by [`ThreadCpuAccounting::stop_tracking`]
#[derive(Debug)]
pub struct ThreadCpuContext {
    handle: ThreadHandle,
    token: u64,
    start_cpu_ms: f64,
}

impl ThreadCpuContext {
    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// CPU time the thread had consumed when tracking started
    pub fn start_cpu_ms(&self) -> f64 {
        self.start_cpu_ms
    }
}

/// CPU consumed over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadCpuMetrics {
    pub thread_id: u64,

    /// Tells apart threads that held the same OS id
    #[serde(default)]
    pub thread_instance: u64,

    /// CPU time spent inside the window
    pub cpu_time_ms: f64,

    /// Wall time of the window
    pub wall_time_ms: f64,

    /// `cpu_time_ms / wall_time_ms`, 0 for an empty window
    pub utilization: f64,

    /// Unix millis when the window closed
    pub measured_at_ms: u64,
}

struct ActiveWindow {
    token: u64,
    start_cpu_ms: f64,
    started: Instant,
}

/// Registry of tracking windows over one platform clock
pub struct ThreadCpuAccounting {
    clock: Arc<dyn CpuClock>,
    active: Mutex<HashMap<ThreadHandle, ActiveWindow>>,
    next_token: AtomicU64,
}

impl ThreadCpuAccounting {
    /// Use this platform's clock; `PlatformUnsupported` if there is none
    pub fn new() -> Result<Self> {
        Ok(Self::with_clock(probe()?))
    }

    pub fn with_clock(clock: Arc<dyn CpuClock>) -> Self {
        Self {
            clock,
            active: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    pub fn clock_name(&self) -> &'static str {
        self.clock.name()
    }

    /// Cumulative CPU time of `thread`
    pub fn get_thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64> {
        self.clock.thread_cpu_time_ms(thread)
    }

    /// Open a window on `thread`. One live window per thread.
    pub fn start_tracking(&self, thread: ThreadHandle) -> Result<ThreadCpuContext> {
        let start_cpu_ms = self.clock.thread_cpu_time_ms(thread)?;

        let mut active = self.active.lock();
        if active.contains_key(&thread) {
            return Err(StateError::AlreadyTracking(thread.raw()));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        active.insert(
            thread,
            ActiveWindow {
                token,
                start_cpu_ms,
                started: Instant::now(),
            },
        );

        Ok(ThreadCpuContext {
            handle: thread,
            token,
            start_cpu_ms,
        })
    }

    /// Close the window and measure it.
    ///
    /// The window is released even when the final clock read fails.
    pub fn stop_tracking(&self, context: ThreadCpuContext) -> Result<ThreadCpuMetrics> {
        let window = self.take_window(&context)?;
        let end_cpu_ms = self.clock.thread_cpu_time_ms(context.handle)?;

        let wall_time_ms = window.started.elapsed().as_secs_f64() * 1_000.0;
        let cpu_time_ms = (end_cpu_ms - window.start_cpu_ms).max(0.0);
        let utilization = if wall_time_ms > 0.0 {
            cpu_time_ms / wall_time_ms
        } else {
            0.0
        };

        Ok(ThreadCpuMetrics {
            thread_id: context.handle.raw(),
            thread_instance: context.handle.instance(),
            cpu_time_ms,
            wall_time_ms,
            utilization,
            measured_at_ms: now_millis(),
        })
    }

    /// Drop a window without measuring it
    pub fn cancel_tracking(&self, context: ThreadCpuContext) {
        let _ = self.take_window(&context);
    }

    pub fn is_tracking(&self, thread: ThreadHandle) -> bool {
        self.active.lock().contains_key(&thread)
    }

    /// Number of live windows
    pub fn active_threads(&self) -> usize {
        self.active.lock().len()
    }

    fn take_window(&self, context: &ThreadCpuContext) -> Result<ActiveWindow> {
        let mut active = self.active.lock();
        match active.get(&context.handle) {
            Some(window) if window.token == context.token => {}
            _ => return Err(lookup_failure(context.handle, "no live tracking context")),
        }
        active
            .remove(&context.handle)
            .ok_or_else(|| lookup_failure(context.handle, "no live tracking context"))
    }
}
