//! Crash point and fault injection for testing durability
//!
//! Named points inside the commit protocol. Two ways to trigger one:
//!
//! - Set `STATECORE_CRASH_POINT=<name>` and the process aborts there: no
//!   cleanup, no unwinding.
//! - Arm a point on an engine's [`CrashPoints`]; the protocol then stops at that
//!   point with `StateError::SimulatedCrash`, skips every cleanup step, and the
//!   engine refuses further work. Dropping the engine and reopening the
//!   directories is the in-process equivalent of a restart.
//!
//! A [`Fault`] is different: the durable operation itself fails with an I/O
//! error and the protocol runs its normal failure handling.

use std::io;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::error::{Result, StateError};

/// Environment variable naming a crash point to abort at
pub const CRASH_POINT_ENV: &str = "STATECORE_CRASH_POINT";

static ENV_CRASH_POINT: OnceLock<Option<CrashPoint>> = OnceLock::new();

/// Points in the commit protocol where a crash can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Before the PREPARE record is written
    BeforePrepare,
    /// PREPARE durable, nothing else done
    AfterPrepare,
    /// Temporary snapshot written but not flushed
    BeforeTempFlush,
    /// Temporary snapshot flushed, not renamed
    AfterTempFlush,
    /// Canonical snapshot replaced, COMMIT not written
    AfterRename,
    /// COMMIT durable, in-memory index not yet published
    AfterCommit,
}

impl CrashPoint {
    pub fn name(self) -> &'static str {
        match self {
            CrashPoint::BeforePrepare => "before_prepare",
            CrashPoint::AfterPrepare => "after_prepare",
            CrashPoint::BeforeTempFlush => "before_temp_flush",
            CrashPoint::AfterTempFlush => "after_temp_flush",
            CrashPoint::AfterRename => "after_rename",
            CrashPoint::AfterCommit => "after_commit",
        }
    }

    /// All points in protocol order
    pub fn all() -> &'static [CrashPoint] {
        &[
            CrashPoint::BeforePrepare,
            CrashPoint::AfterPrepare,
            CrashPoint::BeforeTempFlush,
            CrashPoint::AfterTempFlush,
            CrashPoint::AfterRename,
            CrashPoint::AfterCommit,
        ]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|p| p.name() == name)
    }
}

/// Durable operations of the commit protocol that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// Creating or writing the temporary snapshot
    TempWrite,
    /// Flushing the temporary snapshot
    TempFlush,
    /// Renaming the temporary over the canonical file
    Rename,
    /// Appending the COMMIT record
    CommitAppend,
}

impl Fault {
    pub fn name(self) -> &'static str {
        match self {
            Fault::TempWrite => "temp_write",
            Fault::TempFlush => "temp_flush",
            Fault::Rename => "rename",
            Fault::CommitAppend => "commit_append",
        }
    }
}

/// Per-engine crash point and fault state
#[derive(Default)]
pub struct CrashPoints {
    armed: Mutex<Option<CrashPoint>>,
    fault: Mutex<Option<Fault>>,
}

impl CrashPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop at `point` the next time it is reached (one shot)
    pub fn arm(&self, point: CrashPoint) {
        *self.armed.lock() = Some(point);
    }

    /// Make `fault` fail the next time it is reached (one shot)
    pub fn fail_next(&self, fault: Fault) {
        *self.fault.lock() = Some(fault);
    }

    /// Clear any armed crash point and fault
    pub fn disarm(&self) {
        *self.armed.lock() = None;
        *self.fault.lock() = None;
    }

    /// Called before each durable operation; the caller maps the error
    #[inline]
    pub(crate) fn inject(&self, fault: Fault) -> io::Result<()> {
        let mut armed = self.fault.lock();
        if *armed == Some(fault) {
            *armed = None;
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("injected failure at {}", fault.name()),
            ));
        }
        Ok(())
    }

    /// Called by the protocol at each point
    #[inline]
    pub(crate) fn hit(&self, point: CrashPoint) -> Result<()> {
        if env_crash_point() == Some(point) {
            tracing::error!(point = point.name(), "triggering crash");
            std::process::abort();
        }

        let mut armed = self.armed.lock();
        if *armed == Some(point) {
            *armed = None;
            return Err(StateError::SimulatedCrash(point.name()));
        }
        Ok(())
    }
}

#[inline]
fn env_crash_point() -> Option<CrashPoint> {
    *ENV_CRASH_POINT.get_or_init(|| {
        std::env::var(CRASH_POINT_ENV)
            .ok()
            .and_then(|name| CrashPoint::from_name(&name))
    })
}
