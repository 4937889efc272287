//! macOS thread CPU clock (`thread_info` with `THREAD_BASIC_INFO`)

use std::mem;

use libc::{c_int, c_uint};

use crate::cpu::ThreadHandle;
use crate::error::Result;

use super::{lookup_failure, CpuClock};

type MachPort = c_uint;
type KernReturn = c_int;

const KERN_SUCCESS: KernReturn = 0;
const THREAD_BASIC_INFO: c_int = 3;

#[repr(C)]
#[derive(Default)]
struct TimeValue {
    seconds: c_int,
    microseconds: c_int,
}

#[repr(C)]
#[derive(Default)]
struct ThreadBasicInfo {
    user_time: TimeValue,
    system_time: TimeValue,
    cpu_usage: c_int,
    policy: c_int,
    run_state: c_int,
    flags: c_int,
    suspend_count: c_int,
    sleep_time: c_int,
}

const THREAD_BASIC_INFO_COUNT: c_uint =
    (mem::size_of::<ThreadBasicInfo>() / mem::size_of::<c_int>()) as c_uint;

extern "C" {
    fn thread_info(
        target: MachPort,
        flavor: c_int,
        info_out: *mut c_int,
        info_out_count: *mut c_uint,
    ) -> KernReturn;

    fn pthread_mach_thread_np(thread: libc::pthread_t) -> MachPort;
}

/// Mach thread basic info: user + system time
pub struct DarwinThreadClock;

impl CpuClock for DarwinThreadClock {
    fn thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64> {
        let port = MachPort::try_from(thread.raw())
            .map_err(|_| lookup_failure(thread, "not a mach thread port"))?;

        let mut info = ThreadBasicInfo::default();
        let mut count = THREAD_BASIC_INFO_COUNT;
        // SAFETY: `info` is a THREAD_BASIC_INFO-sized buffer and `count` says so
        let kr = unsafe {
            thread_info(
                port,
                THREAD_BASIC_INFO,
                &mut info as *mut ThreadBasicInfo as *mut c_int,
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            return Err(lookup_failure(thread, format!("thread_info returned {}", kr)));
        }

        let ms = |t: &TimeValue| t.seconds as f64 * 1_000.0 + t.microseconds as f64 / 1_000.0;
        Ok(ms(&info.user_time) + ms(&info.system_time))
    }

    fn name(&self) -> &'static str {
        "mach-thread-basic-info"
    }
}

pub(super) fn current_thread_raw() -> u64 {
    // SAFETY: pthread_self is always a live thread
    unsafe { pthread_mach_thread_np(libc::pthread_self()) as u64 }
}
