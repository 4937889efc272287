//! Crash Recovery Module
//!
//! Brings the WAL and the snapshot directory back into agreement after a
//! crash at any point of the commit protocol, then verifies the canonical
//! snapshot against the last committed digest.
//!
//! Entry point is [`Engine::recover_from_crash`](crate::Engine::recover_from_crash);
//! this module holds the procedure and its report.

mod manager;
mod report;

pub(crate) use manager::{RecoveryManager, RecoveryOutcome};
pub use report::{DigestCheck, RecoveryError, RecoveryErrorKind, RecoveryReport};
