//! Windows thread CPU clock (`GetThreadTimes`)

use std::ffi::c_void;
use std::io;

use crate::cpu::ThreadHandle;
use crate::error::Result;

use super::{lookup_failure, CpuClock};

type Handle = *mut c_void;

const THREAD_QUERY_LIMITED_INFORMATION: u32 = 0x0800;

#[repr(C)]
#[derive(Default)]
struct FileTime {
    low: u32,
    high: u32,
}

impl FileTime {
    /// 100 ns ticks
    fn ticks(&self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn OpenThread(desired_access: u32, inherit_handle: i32, thread_id: u32) -> Handle;
    fn GetThreadTimes(
        thread: Handle,
        creation: *mut FileTime,
        exit: *mut FileTime,
        kernel: *mut FileTime,
        user: *mut FileTime,
    ) -> i32;
    fn CloseHandle(handle: Handle) -> i32;
    fn GetCurrentThreadId() -> u32;
}

/// Kernel + user time from `GetThreadTimes`
pub struct WindowsThreadClock;

impl CpuClock for WindowsThreadClock {
    fn thread_cpu_time_ms(&self, thread: ThreadHandle) -> Result<f64> {
        let id = u32::try_from(thread.raw())
            .map_err(|_| lookup_failure(thread, "not a Windows thread id"))?;

        // SAFETY: OpenThread has no memory preconditions
        let handle = unsafe { OpenThread(THREAD_QUERY_LIMITED_INFORMATION, 0, id) };
        if handle.is_null() {
            return Err(lookup_failure(
                thread,
                format!("OpenThread: {}", io::Error::last_os_error()),
            ));
        }

        let mut creation = FileTime::default();
        let mut exit = FileTime::default();
        let mut kernel = FileTime::default();
        let mut user = FileTime::default();
        // SAFETY: `handle` is open and every out-pointer is a valid FILETIME
        let ok = unsafe { GetThreadTimes(handle, &mut creation, &mut exit, &mut kernel, &mut user) };
        let err = io::Error::last_os_error();
        // SAFETY: `handle` came from OpenThread and is closed exactly once
        unsafe { CloseHandle(handle) };

        if ok == 0 {
            return Err(lookup_failure(thread, format!("GetThreadTimes: {}", err)));
        }

        Ok((kernel.ticks() + user.ticks()) as f64 / 10_000.0)
    }

    fn name(&self) -> &'static str {
        "windows-get-thread-times"
    }
}

pub(super) fn current_thread_raw() -> u64 {
    // SAFETY: no preconditions
    u64::from(unsafe { GetCurrentThreadId() })
}
