//! Thread identity as the platform CPU clock understands it

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::platform;

/// Opaque identifier of an OS thread.
///
/// - Linux / Android: kernel thread id
/// - FreeBSD: `pthread_t`
/// - macOS: mach thread port
/// - Windows: thread id
///
/// A handle outlives its thread; reading the clock of a thread that has
/// exited fails with `ThreadLookupFailure`. The OS may hand the same id to a
/// later thread, so each thread also gets a process-unique `instance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadHandle {
    raw: u64,

    #[serde(default)]
    instance: u64,
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static INSTANCE: u64 = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
}

impl ThreadHandle {
    /// The calling thread
    pub fn current() -> Self {
        Self {
            raw: platform::current_thread_raw(),
            instance: INSTANCE.with(|instance| *instance),
        }
    }

    /// A handle for an OS id obtained elsewhere; its instance is 0
    pub fn from_raw(raw: u64) -> Self {
        Self { raw, instance: 0 }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Which thread, among those that held this OS id, the handle names
    pub fn instance(&self) -> u64 {
        self.instance
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread:{}", self.raw)
    }
}
