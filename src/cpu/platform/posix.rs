//! POSIX thread CPU clocks (`clock_gettime` on a per-thread clock id)

use std::io;

use crate::error::Result;

use super::{lookup_failure, CpuClock};
use crate::cpu::ThreadHandle;

/// `CLOCK_THREAD_CPUTIME`-style clock of an arbitrary thread
pub struct PosixThreadClock;

impl CpuClock for PosixThreadClock {
    fn thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64> {
        let clock = clock_id(thread)?;

        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec
        let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
        if rc != 0 {
            return Err(lookup_failure(
                thread,
                format!("clock_gettime: {}", io::Error::last_os_error()),
            ));
        }

        Ok(ts.tv_sec as f64 * 1_000.0 + ts.tv_nsec as f64 / 1_000_000.0)
    }

    fn name(&self) -> &'static str {
        "posix-thread-cputime"
    }
}

/// Linux encodes the thread id into the clock id, the same value
/// `pthread_getcpuclockid` returns: `(~tid << 3) | CPUCLOCK_PERTHREAD | CPUCLOCK_SCHED`.
/// Keying on the tid makes an exited thread an `EINVAL` instead of a read
/// through a stale `pthread_t`.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn clock_id(thread: ThreadHandle) -> Result<libc::clockid_t> {
    const CPUCLOCK_PERTHREAD: libc::clockid_t = 4;
    const CPUCLOCK_SCHED: libc::clockid_t = 2;

    let tid = libc::pid_t::try_from(thread.raw())
        .map_err(|_| lookup_failure(thread, "not a kernel thread id"))?;
    Ok((!tid << 3) | CPUCLOCK_PERTHREAD | CPUCLOCK_SCHED)
}

#[cfg(target_os = "freebsd")]
fn clock_id(thread: ThreadHandle) -> Result<libc::clockid_t> {
    let mut clock: libc::clockid_t = 0;
    // SAFETY: handles on FreeBSD are `pthread_t` values of live threads
    let rc = unsafe { libc::pthread_getcpuclockid(thread.raw() as libc::pthread_t, &mut clock) };
    if rc != 0 {
        return Err(lookup_failure(
            thread,
            format!("pthread_getcpuclockid: {}", io::Error::from_raw_os_error(rc)),
        ));
    }
    Ok(clock)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(super) fn current_thread_raw() -> u64 {
    // SAFETY: gettid has no preconditions
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(target_os = "freebsd")]
pub(super) fn current_thread_raw() -> u64 {
    // SAFETY: pthread_self has no preconditions
    unsafe { libc::pthread_self() as u64 }
}
