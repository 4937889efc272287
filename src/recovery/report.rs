//! Recovery reports
//!
//! One report per recovery run. Reports are plain data: they serialize to
//! JSON for the audit sink and never change after the run returns.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::SyncMode;
use crate::durability::{rename_atomic, write_synced};
use crate::error::{Result, StateError};
use crate::snapshot::Digest;

/// Outcome of checking the canonical snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DigestCheck {
    /// Not checked (recovery stopped earlier)
    Skipped,

    /// Canonical file matches the digest of the most recent COMMIT
    Verified { digest: Digest },

    /// No COMMIT in the log and no canonical file: nothing was ever committed
    NoCommittedState,

    /// No COMMIT in the log; the canonical file is at least internally consistent
    SelfConsistent { digest: Digest },

    /// Canonical file disagrees with the recorded digest
    Mismatch { expected: Digest, computed: Digest },

    /// Canonical file is missing or unreadable while COMMIT history exists
    Unreadable,
}

/// Failure classes a report can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryErrorKind {
    StateCorruption,
    MerkleMismatch,
    DurableWriteFailure,
    RenameFailure,
    WalCorruption,
    SimulatedCrash,
    Other,
}

/// Structured diagnostic for one failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryError {
    pub kind: RecoveryErrorKind,
    pub message: String,
    pub path: Option<PathBuf>,
    pub tx_id: Option<String>,
    pub expected: Option<Digest>,
    pub computed: Option<Digest>,
    pub hint: Option<String>,
}

impl RecoveryError {
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self.kind,
            RecoveryErrorKind::StateCorruption | RecoveryErrorKind::MerkleMismatch
        )
    }
}

impl From<&StateError> for RecoveryError {
    fn from(err: &StateError) -> Self {
        let kind = match err {
            StateError::StateCorruption { .. } => RecoveryErrorKind::StateCorruption,
            StateError::MerkleMismatch { .. } => RecoveryErrorKind::MerkleMismatch,
            StateError::DurableWriteFailure { .. } => RecoveryErrorKind::DurableWriteFailure,
            StateError::RenameFailure { .. } => RecoveryErrorKind::RenameFailure,
            StateError::WalCorruption(_) => RecoveryErrorKind::WalCorruption,
            StateError::SimulatedCrash(_) => RecoveryErrorKind::SimulatedCrash,
            _ => RecoveryErrorKind::Other,
        };

        let path = match err {
            StateError::StateCorruption { path, .. }
            | StateError::MerkleMismatch { path, .. }
            | StateError::DurableWriteFailure { path, .. } => Some(path.clone()),
            StateError::RenameFailure { to, .. } => Some(to.clone()),
            _ => None,
        };

        let (tx_id, expected, computed) = match err {
            StateError::MerkleMismatch {
                tx_id,
                expected,
                computed,
                ..
            } => (tx_id.clone(), Some(*expected), Some(*computed)),
            _ => (None, None, None),
        };

        Self {
            kind,
            message: err.to_string(),
            path,
            tx_id,
            expected,
            computed,
            hint: err.hint().map(str::to_string),
        }
    }
}

/// Summary of one crash recovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Unix millis when the run started
    pub started_at_ms: u64,

    /// Wall time the run took
    pub duration_us: u64,

    /// Records read from the WAL
    pub wal_entries_scanned: usize,

    /// Records skipped because they failed their CRC
    pub wal_entries_corrupted: u64,

    /// A torn final record was cut off when the WAL was opened
    pub wal_tail_truncated: bool,

    /// Transactions with a PREPARE but no COMMIT/ABORT
    pub uncommitted_found: usize,

    /// Of those, how many were moved to ABORT
    pub rolled_back: usize,

    /// Publications whose COMMIT never landed and were reverted
    pub publications_undone: usize,

    /// Orphaned temporary snapshot files deleted
    pub temp_files_cleaned: usize,

    /// Canonical snapshot verification
    pub digest_check: DigestCheck,

    /// A verified checkpoint is available for `restore_checkpoint`
    pub checkpoint_verified: bool,

    /// WAL records removed by the reconciling compaction
    pub wal_entries_compacted: usize,

    /// Failures, integrity failures first
    pub errors: Vec<RecoveryError>,
}

impl RecoveryReport {
    pub(crate) fn new(started_at_ms: u64) -> Self {
        Self {
            started_at_ms,
            duration_us: 0,
            wal_entries_scanned: 0,
            wal_entries_corrupted: 0,
            wal_tail_truncated: false,
            uncommitted_found: 0,
            rolled_back: 0,
            publications_undone: 0,
            temp_files_cleaned: 0,
            digest_check: DigestCheck::Skipped,
            checkpoint_verified: false,
            wal_entries_compacted: 0,
            errors: Vec::new(),
        }
    }

    /// Nothing needed reconciling and nothing failed
    pub fn is_noop(&self) -> bool {
        self.uncommitted_found == 0
            && self.rolled_back == 0
            && self.publications_undone == 0
            && self.temp_files_cleaned == 0
            && self.wal_entries_compacted == 0
            && self.wal_entries_corrupted == 0
            && !self.wal_tail_truncated
            && self.errors.is_empty()
            && matches!(
                self.digest_check,
                DigestCheck::Verified { .. }
                    | DigestCheck::NoCommittedState
                    | DigestCheck::SelfConsistent { .. }
            )
    }

    /// No failures were recorded
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// The integrity failure that halts the store, if any
    pub fn halting_error(&self) -> Option<&RecoveryError> {
        self.errors.iter().find(|e| e.is_integrity_failure())
    }

    /// Write the report as pretty JSON into `dir`; returns the file path.
    ///
    /// The file is flushed under a temporary name and renamed into place, so
    /// a report on disk is always complete. Existing reports are never
    /// overwritten.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let mut path = dir.join(format!("recovery-{}.json", self.started_at_ms));
        let mut n = 1;
        while path.exists() {
            path = dir.join(format!("recovery-{}-{}.json", self.started_at_ms, n));
            n += 1;
        }
        let json = serde_json::to_vec_pretty(self)?;

        let tmp = path.with_extension("json.tmp");
        write_synced(&tmp, &json, SyncMode::Full)?;
        if let Err(e) = rename_atomic(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        Ok(path)
    }
}
