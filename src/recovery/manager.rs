//! Recovery Manager
//!
//! Runs once per startup, before the engine accepts transactions.
//!
//! ## Recovery Steps
//! 1. Scan the WAL and collect PREPAREs with no COMMIT/ABORT
//! 2. For each: delete its temporary snapshot, undo its publication if the
//!    rename landed without a COMMIT, append ABORT
//! 3. Sweep any other stray temporaries
//! 4. Check the canonical snapshot against the digest of the last COMMIT
//! 5. On an integrity failure: verify the checkpoint and halt
//! 6. Otherwise compact the WAL if anything was reconciled
//! 7. Write the report to the audit sink
//!
//! A second run over a consistent store finds nothing to do and changes
//! nothing on disk except the new report file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::error::{Result, StateError};
use crate::memtable::{undo_changes, State};
use crate::snapshot::{encode_state, state_digest, Digest, SnapshotImage, SnapshotStore};
use crate::wal::{last_commit, now_millis, pending_transactions, transaction_ids, WalEntry, WalWriter};

use super::report::{DigestCheck, RecoveryError, RecoveryReport};

/// Everything the engine needs from a finished recovery run
pub(crate) struct RecoveryOutcome {
    pub report: RecoveryReport,

    /// Verified committed state (empty when halted)
    pub state: State,

    /// Digest of `state`
    pub digest: Digest,

    /// Every transaction id the log has seen
    pub tx_ids: HashSet<String>,

    /// Set when the store must not accept transactions
    pub halt: Option<RecoveryError>,
}

/// Reconciles the WAL with the snapshot directory
pub(crate) struct RecoveryManager<'a> {
    wal: &'a mut WalWriter,
    snapshots: &'a SnapshotStore,
    report_dir: Option<&'a Path>,
}

/// Canonical file as read at the start of recovery
type CanonicalRead = Option<Result<SnapshotImage>>;

impl<'a> RecoveryManager<'a> {
    pub fn new(
        wal: &'a mut WalWriter,
        snapshots: &'a SnapshotStore,
        report_dir: Option<&'a Path>,
    ) -> Self {
        Self {
            wal,
            snapshots,
            report_dir,
        }
    }

    /// Run every recovery step.
    ///
    /// Integrity failures end up in the outcome (`halt`), not in `Err`.
    /// `Err` means recovery itself could not finish, typically because the
    /// WAL could not be written.
    pub fn run(self) -> Result<RecoveryOutcome> {
        let started = Instant::now();
        let mut report = RecoveryReport::new(now_millis());

        if let Some(stats) = self.wal.take_open_stats() {
            report.wal_tail_truncated = stats.was_truncated;
        }

        // Step 1: scan
        let scan = self.wal.scan()?;
        report.wal_entries_scanned = scan.entries.len();
        report.wal_entries_corrupted = scan.stats.entries_corrupted;
        if scan.stats.entries_corrupted > 0 {
            warn!(
                corrupted = scan.stats.entries_corrupted,
                "WAL contains records that failed their checksum"
            );
        }

        let pending = pending_transactions(&scan.entries);
        let committed = last_commit(&scan.entries).cloned();
        let committed_digest = match committed.as_ref().and_then(|c| c.post_digest) {
            Some(digest) => digest,
            None => state_digest(&State::new())?,
        };
        let tx_ids = transaction_ids(&scan.entries);
        report.uncommitted_found = pending.len();
        debug!(
            entries = scan.entries.len(),
            pending = pending.len(),
            last_commit_lsn = committed.as_ref().map(|c| c.lsn),
            "WAL scanned"
        );

        let canonical_path = self.snapshots.canonical_path();
        let mut canonical: CanonicalRead = self
            .snapshots
            .read_canonical()?
            .map(|bytes| SnapshotImage::parse(&canonical_path, bytes));

        // Step 2: roll back pending transactions
        for prepare in &pending {
            if self.snapshots.remove_temp(&self.snapshots.temp_path(prepare.lsn))? {
                report.temp_files_cleaned += 1;
            }

            if published_without_commit(prepare, committed.as_ref(), committed_digest, &canonical) {
                match self.undo_publication(prepare, &canonical_path, &canonical) {
                    Ok(restored) => {
                        canonical = Some(Ok(restored));
                        report.publications_undone += 1;
                        info!(tx_id = %prepare.tx_id, "undid publication with no COMMIT");
                    }
                    Err(e) => {
                        error!(tx_id = %prepare.tx_id, error = %e, "cannot undo publication");
                        report.errors.push(RecoveryError::from(&e));
                    }
                }
            }

            self.wal.append_abort(&prepare.tx_id)?;
            report.rolled_back += 1;
            info!(tx_id = %prepare.tx_id, lsn = prepare.lsn, "rolled back uncommitted transaction");
        }

        // Step 3: stray temporaries
        for path in self.snapshots.temp_files()? {
            if self.snapshots.remove_temp(&path)? {
                report.temp_files_cleaned += 1;
                debug!(path = %path.display(), "removed orphaned temporary snapshot");
            }
        }

        // Step 4: verify
        let expected = committed.as_ref().and_then(|c| c.post_digest);
        let tx_id = committed.as_ref().map(|c| c.tx_id.clone());
        let verified = verify(&canonical_path, canonical, expected, tx_id);

        // Step 5: halt on integrity failure
        let (state, digest, halt) = match verified {
            Ok((state, digest, check)) => {
                report.digest_check = check;
                (state, digest, None)
            }
            Err(e) => {
                error!(error = %e, "canonical snapshot failed verification, halting");
                report.digest_check = match &e {
                    StateError::MerkleMismatch {
                        expected, computed, ..
                    } => DigestCheck::Mismatch {
                        expected: *expected,
                        computed: *computed,
                    },
                    _ => DigestCheck::Unreadable,
                };
                let failure = RecoveryError::from(&e);
                report.errors.insert(0, failure.clone());

                match self.verify_checkpoint() {
                    Ok(true) => report.checkpoint_verified = true,
                    Ok(false) => warn!("no checkpoint available to restore from"),
                    Err(ce) => {
                        error!(error = %ce, "checkpoint failed verification");
                        report.errors.push(RecoveryError::from(&ce));
                    }
                }

                let empty = State::new();
                let digest = state_digest(&empty)?;
                (empty, digest, Some(failure))
            }
        };

        // Step 6: compact what was reconciled
        if halt.is_none() && (report.rolled_back > 0 || report.temp_files_cleaned > 0) {
            match self.wal.compact() {
                Ok(stats) => report.wal_entries_compacted = stats.entries_removed(),
                Err(e) => {
                    warn!(error = %e, "WAL compaction after recovery failed");
                    report.errors.push(RecoveryError::from(&e));
                }
            }
        }

        report.duration_us = started.elapsed().as_micros() as u64;

        // Step 7: audit sink
        if let Some(dir) = self.report_dir {
            match report.write_to(dir) {
                Ok(path) => debug!(path = %path.display(), "recovery report written"),
                Err(e) => warn!(error = %e, "could not write recovery report"),
            }
        }

        info!(
            rolled_back = report.rolled_back,
            undone = report.publications_undone,
            temps = report.temp_files_cleaned,
            halted = halt.is_some(),
            duration_us = report.duration_us,
            "crash recovery finished"
        );

        Ok(RecoveryOutcome {
            report,
            state,
            digest,
            tx_ids,
            halt,
        })
    }

    /// Revert a publication using the pre-images stored in its PREPARE.
    ///
    /// The reverted state must hash to the PREPARE's pre-digest, otherwise
    /// nothing is written.
    fn undo_publication(
        &self,
        prepare: &WalEntry,
        canonical_path: &Path,
        canonical: &CanonicalRead,
    ) -> Result<SnapshotImage> {
        let image = match canonical {
            Some(Ok(image)) => image,
            _ => {
                return Err(StateError::StateCorruption {
                    path: canonical_path.to_path_buf(),
                    detail: "canonical snapshot unreadable during undo".into(),
                })
            }
        };

        let mut state = image.decode_state(canonical_path)?;
        undo_changes(&mut state, &prepare.changes);
        let encoded = encode_state(&state)?;

        if let Some(pre) = prepare.pre_digest {
            if encoded.digest != pre {
                return Err(StateError::MerkleMismatch {
                    path: canonical_path.to_path_buf(),
                    tx_id: Some(prepare.tx_id.clone()),
                    expected: pre,
                    computed: encoded.digest,
                });
            }
        }

        self.snapshots.install(prepare.lsn, &encoded.bytes)?;
        SnapshotImage::parse(canonical_path, encoded.bytes)
    }

    /// Check that a checkpoint exists and matches its metadata
    fn verify_checkpoint(&self) -> Result<bool> {
        let checkpoint = match self.snapshots.read_checkpoint()? {
            Some(found) => found,
            None => return Ok(false),
        };
        let meta = &checkpoint.meta;
        if !checkpoint.image.matches(&meta.digest) {
            return Err(StateError::MerkleMismatch {
                path: checkpoint.path.clone(),
                tx_id: None,
                expected: meta.digest,
                computed: checkpoint.image.computed,
            });
        }
        checkpoint.image.decode_state(&checkpoint.path)?;
        info!(digest = %meta.digest.short(), lsn = meta.lsn, "checkpoint verified");
        Ok(true)
    }
}

/// The canonical file holds a PREPARE's post-state that no COMMIT vouches for.
///
/// Publications happen in PREPARE order, so only a PREPARE staged on the last
/// committed digest can have reached the rename.
fn published_without_commit(
    prepare: &WalEntry,
    committed: Option<&WalEntry>,
    committed_digest: Digest,
    canonical: &CanonicalRead,
) -> bool {
    let (post, pre) = match (prepare.post_digest, prepare.pre_digest) {
        (Some(post), Some(pre)) => (post, pre),
        _ => return false,
    };
    let image = match canonical {
        Some(Ok(image)) => image,
        _ => return false,
    };
    let after_last_commit = committed.map_or(true, |c| prepare.lsn > c.lsn);

    after_last_commit && pre == committed_digest && post != pre && image.matches(&post)
}

/// Decide what the canonical file is worth
fn verify(
    path: &Path,
    canonical: CanonicalRead,
    expected: Option<Digest>,
    tx_id: Option<String>,
) -> Result<(State, Digest, DigestCheck)> {
    match (canonical, expected) {
        (None, None) => {
            let state = State::new();
            let digest = state_digest(&state)?;
            Ok((state, digest, DigestCheck::NoCommittedState))
        }
        (None, Some(digest)) => Err(StateError::StateCorruption {
            path: path.to_path_buf(),
            detail: format!(
                "canonical snapshot is missing but the WAL records committed digest {}",
                digest
            ),
        }),
        (Some(Err(e)), _) => Err(e),
        (Some(Ok(image)), Some(digest)) => {
            if image.matches(&digest) {
                let state = image.decode_state(path)?;
                Ok((state, digest, DigestCheck::Verified { digest }))
            } else {
                let computed = if image.computed != digest {
                    image.computed
                } else {
                    image.recorded
                };
                Err(StateError::MerkleMismatch {
                    path: path.to_path_buf(),
                    tx_id,
                    expected: digest,
                    computed,
                })
            }
        }
        (Some(Ok(image)), None) => {
            if image.is_self_consistent() {
                let state = image.decode_state(path)?;
                let digest = image.computed;
                Ok((state, digest, DigestCheck::SelfConsistent { digest }))
            } else {
                Err(StateError::MerkleMismatch {
                    path: path.to_path_buf(),
                    tx_id: None,
                    expected: image.recorded,
                    computed: image.computed,
                })
            }
        }
    }
}
