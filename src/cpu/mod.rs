//! Thread CPU Accounting
//!
//! Per-thread CPU time from kernel counters, measured over a tracked window
//! and compared against a threshold.
//!
//! ```text
//!   start_tracking(handle) ──► ThreadCpuContext
//!                                   │   (work runs)
//!   stop_tracking(context) ──► ThreadCpuMetrics ──► ViolationDetector
//! ```
//!
//! Exactly one [`CpuClock`] is chosen per process by [`platform::probe`].

mod handle;
pub mod platform;
mod tracker;
mod violation;

pub use handle::ThreadHandle;
pub use platform::{probe, CpuClock};
pub use tracker::{ThreadCpuAccounting, ThreadCpuContext, ThreadCpuMetrics};
pub use violation::{check_violation, CpuViolation, ViolationDetector};
