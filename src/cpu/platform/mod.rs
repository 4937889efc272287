//! Platform CPU clocks
//!
//! One reader per supported OS, selected at compile time and checked once
//! at runtime by [`probe`].

use std::sync::Arc;

use crate::error::{Result, StateError};

use super::ThreadHandle;

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
mod posix;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub use posix::PosixThreadClock;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "macos")]
pub use darwin::DarwinThreadClock;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::WindowsThreadClock;

/// Reads the CPU time (user + system) a thread has consumed
pub trait CpuClock: Send + Sync {
    /// Cumulative CPU time of `thread` in milliseconds
    fn thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Select this platform's clock and make sure it can read the calling thread
pub fn probe() -> Result<Arc<dyn CpuClock>> {
    let clock = platform_clock()?;
    clock.thread_cpu_time_ms(ThreadHandle::current())?;
    tracing::debug!(clock = clock.name(), "thread CPU clock selected");
    Ok(clock)
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn platform_clock() -> Result<Arc<dyn CpuClock>> {
    Ok(Arc::new(PosixThreadClock))
}

#[cfg(target_os = "macos")]
fn platform_clock() -> Result<Arc<dyn CpuClock>> {
    Ok(Arc::new(DarwinThreadClock))
}

#[cfg(windows)]
fn platform_clock() -> Result<Arc<dyn CpuClock>> {
    Ok(Arc::new(WindowsThreadClock))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos",
    windows
)))]
fn platform_clock() -> Result<Arc<dyn CpuClock>> {
    Err(StateError::PlatformUnsupported(std::env::consts::OS))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn current_thread_raw() -> u64 {
    posix::current_thread_raw()
}

#[cfg(target_os = "macos")]
pub(crate) fn current_thread_raw() -> u64 {
    darwin::current_thread_raw()
}

#[cfg(windows)]
pub(crate) fn current_thread_raw() -> u64 {
    self::windows::current_thread_raw()
}

/// No OS identity available; hand out process-unique ids instead
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "macos",
    windows
)))]
pub(crate) fn current_thread_raw() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

pub(crate) fn lookup_failure(thread: ThreadHandle, detail: impl Into<String>) -> StateError {
    StateError::ThreadLookupFailure {
        thread: thread.raw(),
        detail: detail.into(),
    }
}
