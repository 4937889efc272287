//! Error types for statecore
//!
//! Provides a unified error type for all operations. Integrity failures
//! (`StateCorruption`, `MerkleMismatch`) carry enough detail to drive a manual
//! recovery; they are never absorbed into a default state.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::snapshot::Digest;

/// Result type alias using StateError
pub type Result<T> = std::result::Result<T, StateError>;

/// Unified error type for statecore operations
#[derive(Debug, Error)]
pub enum StateError {
    // -------------------------------------------------------------------------
    // Integrity Errors (halt the store)
    // -------------------------------------------------------------------------
    #[error("state corruption at {}: {detail}", path.display())]
    StateCorruption { path: PathBuf, detail: String },

    #[error(
        "digest mismatch at {} (tx {}): expected {expected}, computed {computed}",
        path.display(),
        tx_id.as_deref().unwrap_or("-")
    )]
    MerkleMismatch {
        path: PathBuf,
        tx_id: Option<String>,
        expected: Digest,
        computed: Digest,
    },

    // -------------------------------------------------------------------------
    // Durability Errors (abort the in-flight transaction)
    // -------------------------------------------------------------------------
    #[error("durable write failed at {}: {source}", path.display())]
    DurableWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("atomic rename {} -> {} failed: {source}", from.display(), to.display())]
    RenameFailure {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    // -------------------------------------------------------------------------
    // CPU Accounting Errors (degrade one thread's signal only)
    // -------------------------------------------------------------------------
    #[error("no thread CPU clock available on {0}")]
    PlatformUnsupported(&'static str),

    #[error("cannot read CPU time for thread {thread}: {detail}")]
    ThreadLookupFailure { thread: u64, detail: String },

    #[error("thread {0} already has a live tracking context")]
    AlreadyTracking(u64),

    // -------------------------------------------------------------------------
    // I/O and Encoding Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("crash recovery has not run; the store is not accepting transactions")]
    NotRecovered,

    #[error("store halted: {reason} (hint: {hint})")]
    StoreHalted { reason: String, hint: String },

    #[error("transaction id already in use: {0}")]
    TransactionIdInUse(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("transaction {0} was staged on changes that never committed")]
    CommitConflict(String),

    #[error("simulated crash at {0}")]
    SimulatedCrash(&'static str),
}

impl StateError {
    /// True for failures that must stop the store from accepting transactions.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            StateError::StateCorruption { .. } | StateError::MerkleMismatch { .. }
        )
    }

    /// True for CPU accounting failures that only skip one thread's signal.
    pub fn is_accounting_failure(&self) -> bool {
        matches!(
            self,
            StateError::PlatformUnsupported(_)
                | StateError::ThreadLookupFailure { .. }
                | StateError::AlreadyTracking(_)
        )
    }

    /// Operator guidance attached to hard failures.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            StateError::StateCorruption { .. } => Some(
                "canonical snapshot is missing or unreadable; restore it from a checkpoint \
                 (`statecore restore-checkpoint`) or backup, then rerun recovery",
            ),
            StateError::MerkleMismatch { .. } => Some(
                "canonical snapshot does not match the committed digest; inspect the file, \
                 then run `statecore restore-checkpoint`",
            ),
            StateError::DurableWriteFailure { .. } => {
                Some("check free space and device health; the transaction was rolled back")
            }
            StateError::RenameFailure { .. } => Some(
                "the temporary snapshot was left in place; the next recovery removes it",
            ),
            StateError::CommitConflict(_) => {
                Some("an earlier transaction aborted; retry the change under a new id")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for StateError {
    fn from(e: bincode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}
