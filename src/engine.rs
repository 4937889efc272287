//! Engine Module
//!
//! The commit layer: ties the WAL, the in-memory index and the snapshot
//! directory together so a transaction's changes are visible everywhere or
//! nowhere.
//!
//! ## Responsibilities
//! - Run the PREPARE → temp snapshot → flush → rename → COMMIT protocol
//! - Refuse transactions until crash recovery has run
//! - Halt on integrity failures and restore from a checkpoint on request

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crash_point::{CrashPoint, CrashPoints, Fault};
use crate::error::{Result, StateError};
use crate::memtable::{apply_changes, MemTable, State};
use crate::recovery::{RecoveryError, RecoveryManager, RecoveryReport};
use crate::snapshot::{
    encode_state, state_digest, CheckpointMeta, Digest, EncodedSnapshot, SnapshotImage,
    SnapshotStore, TempSnapshot,
};
use crate::txn::{CommitReceipt, Transaction, TxStatus};
use crate::wal::{Change, CompactionStats, WalEntry, WalWriter};

/// Where the engine is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    /// Opened; `recover_from_crash` has not run yet
    Uninitialized,

    /// Accepting transactions
    Ready,

    /// Refusing transactions until an operator intervenes
    Halted(RecoveryError),
}

/// Tip of the PREPARE order
struct Sequencer {
    /// State after every PREPARE staged so far
    head: Arc<State>,
    head_digest: Digest,
    next_ticket: u64,
}

/// A transaction between PREPARE and publication
struct Staged {
    prepared: WalEntry,
    state: Arc<State>,
    encoded: EncodedSnapshot,
    ticket: u64,
}

/// Exclusive right to publish; the next ticket is served on drop
struct PublishTurn<'a> {
    serving: MutexGuard<'a, u64>,
    changed: &'a Condvar,
}

impl Drop for PublishTurn<'_> {
    fn drop(&mut self) {
        *self.serving += 1;
        self.changed.notify_all();
    }
}

/// The commit engine
///
/// ## Concurrency Model
///
/// - **Staging + PREPARE**: under `sequencer`, which holds the WAL lock only
///   for the append. Each PREPARE is staged on the one before it and takes a
///   ticket.
/// - **Temp write + flush**: no lock; commits overlap here
/// - **Rename + COMMIT + publish**: in ticket order, one at a time. A
///   transaction whose pre-state never committed aborts with
///   `CommitConflict`.
/// - **Reads**: concurrent; they see the last published `Arc<State>`
/// - **Recovery / restore**: take `gate` exclusively, commits take it
///   shared, so neither runs while a commit is in flight
///
/// Lock order: gate → sequencer → wal, and gate → publication → wal or
/// sequencer.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Write-ahead log (exclusive access needed)
    wal: Mutex<WalWriter>,

    wal_path: PathBuf,

    /// Committed state visible to readers
    memtable: MemTable,

    /// Canonical snapshot, temporaries and checkpoint
    snapshots: SnapshotStore,

    /// Digest of the published state
    committed_digest: RwLock<Digest>,

    lifecycle: RwLock<EngineStatus>,

    /// Shared by commits, exclusive for recovery and restore
    gate: RwLock<()>,

    sequencer: Mutex<Sequencer>,

    /// Ticket currently allowed to publish
    publication: Mutex<u64>,
    turn_changed: Condvar,

    /// Ids seen in the log or handed out since open
    tx_ids: Mutex<HashSet<String>>,

    crash_points: CrashPoints,

    last_report: Mutex<Option<RecoveryReport>>,
}

impl Engine {
    // =========================================================================
    // Internal Path Constants
    // =========================================================================
    const WAL_FILENAME: &'static str = "wal.log";

    /// Open or create an engine with the given config
    ///
    /// The engine starts `Uninitialized`; call [`Engine::recover_from_crash`]
    /// before beginning transactions.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Step 1: directories
        fs::create_dir_all(&config.wal_dir)?;
        let snapshots = SnapshotStore::open(&config.snapshot_dir, config.sync_mode)?;

        // Step 2: WAL (cuts a torn tail)
        let wal_path = config.wal_dir.join(Self::WAL_FILENAME);
        let wal = WalWriter::open(&wal_path, config.sync_mode)?;

        let empty_digest = state_digest(&State::new())?;

        debug!(
            wal = %config.wal_dir.display(),
            snapshots = %config.snapshot_dir.display(),
            "engine opened"
        );

        Ok(Self {
            config,
            wal: Mutex::new(wal),
            wal_path,
            memtable: MemTable::new(),
            snapshots,
            committed_digest: RwLock::new(empty_digest),
            lifecycle: RwLock::new(EngineStatus::Uninitialized),
            gate: RwLock::new(()),
            sequencer: Mutex::new(Sequencer {
                head: Arc::new(State::new()),
                head_digest: empty_digest,
                next_ticket: 0,
            }),
            publication: Mutex::new(0),
            turn_changed: Condvar::new(),
            tx_ids: Mutex::new(HashSet::new()),
            crash_points: CrashPoints::new(),
            last_report: Mutex::new(None),
        })
    }

    /// Open and run crash recovery in one step
    pub fn open_and_recover(config: Config) -> Result<(Self, RecoveryReport)> {
        let engine = Self::open(config)?;
        let report = engine.recover_from_crash()?;
        Ok((engine, report))
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reconcile the WAL with the snapshot directory and verify the result.
    ///
    /// Returns the report for every completed run, including runs that halt
    /// the store; check [`Engine::status`] afterwards. Safe to call again:
    /// a second run over a consistent store changes nothing.
    pub fn recover_from_crash(&self) -> Result<RecoveryReport> {
        let _exclusive = self.gate.write();
        let mut seq = self.sequencer.lock();
        let mut wal = self.wal.lock();

        info!("crash recovery started");
        let outcome =
            match RecoveryManager::new(&mut wal, &self.snapshots, self.config.report_dir.as_deref())
                .run()
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "crash recovery could not complete");
                    self.halt(&e);
                    return Err(e);
                }
            };
        drop(wal);

        *self.tx_ids.lock() = outcome.tx_ids;
        // A halted outcome carries the empty state
        let state = Arc::new(outcome.state);
        self.memtable.publish(Arc::clone(&state));
        *self.committed_digest.write() = outcome.digest;
        seq.head = state;
        seq.head_digest = outcome.digest;
        *self.lifecycle.write() = match outcome.halt {
            None => EngineStatus::Ready,
            Some(failure) => EngineStatus::Halted(failure),
        };

        *self.last_report.lock() = Some(outcome.report.clone());
        Ok(outcome.report)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a transaction with a caller-chosen id.
    ///
    /// Ids are unique across the life of the log.
    pub fn begin_transaction(&self, tx_id: impl Into<String>) -> Result<Transaction> {
        self.ensure_ready()?;

        let tx_id = tx_id.into();
        if tx_id.is_empty() {
            return Err(StateError::InvalidTransaction(
                "transaction id must not be empty".into(),
            ));
        }
        if !self.tx_ids.lock().insert(tx_id.clone()) {
            return Err(StateError::TransactionIdInUse(tx_id));
        }

        debug!(tx_id = %tx_id, "transaction started");
        Ok(Transaction::new(tx_id))
    }

    /// Commit a transaction
    ///
    /// Steps:
    /// 1. Stage the change-set on the state left by the previous PREPARE
    /// 2. Append PREPARE (change-set, pre/post digests) and flush it
    /// 3. Write the staged snapshot to a temporary file
    /// 4. Flush the temporary file
    /// 5. Rename it over the canonical file
    /// 6. Append COMMIT with the new digest and flush it
    /// 7. Publish the staged state to readers
    ///
    /// Steps 3-4 of different transactions overlap; steps 5-7 run in PREPARE
    /// order. A failure before step 5 aborts and leaves the state untouched.
    /// A failure after step 5 reverts the canonical file before aborting;
    /// if even that fails the store halts and recovery takes over.
    pub fn commit_transaction(&self, tx: &mut Transaction) -> Result<CommitReceipt> {
        let _gate = self.gate.read();
        self.ensure_ready()?;
        if tx.status != TxStatus::Pending || tx.prepare_lsn.is_some() {
            return Err(StateError::InvalidTransaction(format!(
                "{} is {:?} and cannot be committed",
                tx.id, tx.status
            )));
        }

        // Steps 1-2
        let Staged {
            prepared,
            state,
            encoded,
            ticket,
        } = self.stage(tx)?;
        let temp_path = self.snapshots.temp_path(prepared.lsn);

        // Steps 3-4
        let written = self.write_temp(prepared.lsn, &encoded.bytes);

        let _turn = self.wait_turn(ticket);
        let written = match written {
            Err(e @ StateError::SimulatedCrash(_)) => return Err(e),
            other => other,
        };
        // A halt raised by another commit leaves this PREPARE to recovery
        self.ensure_ready()?;
        let temp = match written {
            Ok(temp) => temp,
            Err(e) => return Err(self.abort_prepared(tx, Some(&temp_path), e)),
        };
        if tx.pre_digest != Some(*self.committed_digest.read()) {
            drop(temp);
            let conflict = StateError::CommitConflict(tx.id.clone());
            return Err(self.abort_prepared(tx, Some(&temp_path), conflict));
        }
        let previous = self.memtable.snapshot();

        // Step 5: publish
        let renamed = self
            .crash_points
            .inject(Fault::Rename)
            .map_err(|source| StateError::RenameFailure {
                from: temp_path.clone(),
                to: self.snapshots.canonical_path(),
                source,
            })
            .and_then(|()| self.snapshots.publish(&temp));
        match renamed {
            Ok(()) => {}
            // Rename never happened; the temporary stays for recovery to sweep
            Err(e @ StateError::RenameFailure { .. }) => {
                return Err(self.abort_prepared(tx, None, e));
            }
            // Renamed, but the directory entry may not be durable
            Err(e) => return Err(self.undo_publication(tx, &previous, &prepared, e)),
        }
        self.crash(CrashPoint::AfterRename)?;

        // Step 6: COMMIT
        let committed = self
            .crash_points
            .inject(Fault::CommitAppend)
            .map_err(|source| StateError::DurableWriteFailure {
                path: self.wal_path.clone(),
                source,
            })
            .and_then(|()| self.wal.lock().mark_committed(&prepared, encoded.digest));
        let commit = match committed {
            Ok(entry) => entry,
            Err(e) => return Err(self.undo_publication(tx, &previous, &prepared, e)),
        };
        self.crash(CrashPoint::AfterCommit)?;

        // Step 7: make visible
        self.memtable.publish(state);
        *self.committed_digest.write() = encoded.digest;
        tx.status = TxStatus::Committed;

        debug!(
            tx_id = %tx.id,
            prepare_lsn = prepared.lsn,
            commit_lsn = commit.lsn,
            digest = %encoded.digest.short(),
            "transaction committed"
        );

        Ok(CommitReceipt {
            tx_id: tx.id.clone(),
            prepare_lsn: prepared.lsn,
            commit_lsn: commit.lsn,
            digest: encoded.digest,
        })
    }

    /// Roll back a pending transaction.
    ///
    /// Records ABORT so the id is never reinterpreted.
    pub fn rollback_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let _gate = self.gate.read();
        if tx.status != TxStatus::Pending {
            return Err(StateError::InvalidTransaction(format!(
                "{} is {:?} and cannot be rolled back",
                tx.id, tx.status
            )));
        }
        // A prepared transaction on a halted store belongs to recovery
        if tx.prepare_lsn.is_some() {
            self.ensure_ready()?;
        }

        self.wal.lock().append_abort(&tx.id)?;
        if let Some(lsn) = tx.prepare_lsn {
            self.snapshots.remove_temp(&self.snapshots.temp_path(lsn))?;
        }
        tx.status = TxStatus::RolledBack;

        debug!(tx_id = %tx.id, "transaction rolled back");
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the committed value for `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_ready()?;
        Ok(self.memtable.get(key))
    }

    /// Digest of the committed state
    pub fn snapshot_digest(&self) -> Result<Digest> {
        self.ensure_ready()?;
        Ok(*self.committed_digest.read())
    }

    /// Copy of the committed key/value index
    pub fn state(&self) -> Result<State> {
        self.ensure_ready()?;
        Ok((*self.memtable.snapshot()).clone())
    }

    /// Number of committed keys
    pub fn len(&self) -> usize {
        self.memtable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtable.is_empty()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// PREPAREs that have no COMMIT/ABORT yet
    pub fn list_uncommitted(&self) -> Result<Vec<WalEntry>> {
        self.wal.lock().list_uncommitted()
    }

    /// Rewrite the WAL to one record per transaction
    pub fn compact(&self) -> Result<CompactionStats> {
        let _gate = self.gate.read();
        self.ensure_ready()?;
        self.wal.lock().compact()
    }

    /// Save the committed state as the last known-good checkpoint.
    ///
    /// The in-memory state and the canonical file must both match the
    /// committed digest; a checkpoint is never taken from unverified state.
    pub fn checkpoint(&self) -> Result<CheckpointMeta> {
        let _gate = self.gate.read();
        self.ensure_ready()?;
        // Holding the lock keeps every publication out
        let _publication = self.publication.lock();

        let digest = *self.committed_digest.read();
        let encoded = encode_state(&self.memtable.snapshot())?;
        let canonical_path = self.snapshots.canonical_path();
        if encoded.digest != digest {
            return Err(StateError::MerkleMismatch {
                path: canonical_path,
                tx_id: None,
                expected: digest,
                computed: encoded.digest,
            });
        }
        if let Some(bytes) = self.snapshots.read_canonical()? {
            let image = SnapshotImage::parse(&canonical_path, bytes)?;
            if !image.matches(&digest) {
                return Err(StateError::MerkleMismatch {
                    path: canonical_path,
                    tx_id: None,
                    expected: digest,
                    computed: image.computed,
                });
            }
        }

        let lsn = self.wal.lock().current_lsn().saturating_sub(1);
        let meta = self.snapshots.write_checkpoint(&encoded.bytes, digest, lsn)?;

        info!(digest = %digest.short(), lsn = meta.lsn, body = %meta.body, "checkpoint written");
        Ok(meta)
    }

    /// Replace the canonical snapshot with the verified checkpoint.
    ///
    /// Operator action after a halt. Pending PREPAREs are aborted, the
    /// rejected canonical file is moved aside, and a reset COMMIT records
    /// the restored digest. Leaves the store `Ready`.
    pub fn restore_checkpoint(&self) -> Result<Digest> {
        let _exclusive = self.gate.write();
        let mut seq = self.sequencer.lock();

        let checkpoint = self.snapshots.read_checkpoint()?.ok_or_else(|| {
            StateError::StateCorruption {
                path: self.snapshots.checkpoint_meta_path(),
                detail: "no checkpoint has been taken".into(),
            }
        })?;
        if !checkpoint.image.matches(&checkpoint.meta.digest) {
            return Err(StateError::MerkleMismatch {
                path: checkpoint.path,
                tx_id: None,
                expected: checkpoint.meta.digest,
                computed: checkpoint.image.computed,
            });
        }
        let state = checkpoint.image.decode_state(&checkpoint.path)?;
        let encoded = encode_state(&state)?;

        let mut wal = self.wal.lock();
        for pending in wal.list_uncommitted()? {
            wal.append_abort(&pending.tx_id)?;
            self.snapshots
                .remove_temp(&self.snapshots.temp_path(pending.lsn))?;
            info!(tx_id = %pending.tx_id, "aborted pending transaction before restore");
        }

        if let Some(aside) = self.snapshots.reject_canonical()? {
            warn!(path = %aside.display(), "rejected canonical snapshot moved aside");
        }

        let lsn = wal.current_lsn();
        self.snapshots.install(lsn, &encoded.bytes)?;

        let restore_id = format!("checkpoint-restore-{}", lsn);
        let changes: Vec<Change> = state
            .iter()
            .map(|(key, value)| Change::put(key.clone(), value.clone()))
            .collect();
        wal.append_reset(&restore_id, changes, encoded.digest)?;
        drop(wal);

        self.tx_ids.lock().insert(restore_id);
        let state = Arc::new(state);
        self.memtable.publish(Arc::clone(&state));
        *self.committed_digest.write() = encoded.digest;
        seq.head = state;
        seq.head_digest = encoded.digest;
        *self.lifecycle.write() = EngineStatus::Ready;

        info!(
            digest = %encoded.digest.short(),
            checkpoint_lsn = checkpoint.meta.lsn,
            "restored from checkpoint"
        );
        Ok(encoded.digest)
    }

    /// Sync the WAL and drop the engine
    pub fn close(self) -> Result<()> {
        self.wal.lock().sync()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_ready(&self) -> Result<()> {
        match &*self.lifecycle.read() {
            EngineStatus::Ready => Ok(()),
            EngineStatus::Uninitialized => Err(StateError::NotRecovered),
            EngineStatus::Halted(failure) => Err(StateError::StoreHalted {
                reason: failure.message.clone(),
                hint: failure
                    .hint
                    .clone()
                    .unwrap_or_else(|| "rerun crash recovery".to_string()),
            }),
        }
    }

    fn halt(&self, err: &StateError) {
        *self.lifecycle.write() = EngineStatus::Halted(RecoveryError::from(err));
    }

    /// Stop at a crash point; an in-process crash leaves the store halted
    /// with every on-disk artifact exactly as it was.
    fn crash(&self, point: CrashPoint) -> Result<()> {
        self.crash_points.hit(point).map_err(|e| {
            self.halt(&e);
            e
        })
    }

    /// Steps 1-2: stage on the sequencer head and append PREPARE
    fn stage(&self, tx: &mut Transaction) -> Result<Staged> {
        let mut seq = self.sequencer.lock();

        let mut staged = (*seq.head).clone();
        apply_changes(&mut staged, &mut tx.changes);
        let encoded = encode_state(&staged)?;
        let pre_digest = seq.head_digest;
        tx.pre_digest = Some(pre_digest);
        tx.post_digest = Some(encoded.digest);

        self.crash(CrashPoint::BeforePrepare)?;
        let appended =
            self.wal
                .lock()
                .append_prepared(&tx.id, tx.changes.clone(), pre_digest, encoded.digest);
        let prepared = match appended {
            Ok(entry) => entry,
            Err(e) => {
                tx.status = TxStatus::RolledBack;
                warn!(tx_id = %tx.id, error = %e, "PREPARE failed");
                return Err(e);
            }
        };
        tx.prepare_lsn = Some(prepared.lsn);

        let state = Arc::new(staged);
        seq.head = Arc::clone(&state);
        seq.head_digest = encoded.digest;
        let ticket = seq.next_ticket;
        seq.next_ticket += 1;

        Ok(Staged {
            prepared,
            state,
            encoded,
            ticket,
        })
    }

    /// Steps 3-4: temporary snapshot for the PREPARE at `lsn`
    fn write_temp(&self, lsn: u64, bytes: &[u8]) -> Result<TempSnapshot> {
        self.crash(CrashPoint::AfterPrepare)?;

        let path = self.snapshots.temp_path(lsn);
        let write_failure = |source| StateError::DurableWriteFailure {
            path: path.clone(),
            source,
        };

        self.crash_points
            .inject(Fault::TempWrite)
            .map_err(write_failure)?;
        let temp = self.snapshots.create_temp(lsn, bytes)?;
        self.crash(CrashPoint::BeforeTempFlush)?;

        self.crash_points
            .inject(Fault::TempFlush)
            .map_err(write_failure)?;
        temp.sync(self.config.sync_mode)?;
        self.crash(CrashPoint::AfterTempFlush)?;

        Ok(temp)
    }

    /// Block until `ticket` may publish
    fn wait_turn(&self, ticket: u64) -> PublishTurn<'_> {
        let mut serving = self.publication.lock();
        while *serving != ticket {
            self.turn_changed.wait(&mut serving);
        }
        PublishTurn {
            serving,
            changed: &self.turn_changed,
        }
    }

    /// Undo a PREPARE whose publication never happened
    fn abort_prepared(
        &self,
        tx: &mut Transaction,
        temp: Option<&Path>,
        cause: StateError,
    ) -> StateError {
        if let Some(path) = temp {
            if let Err(e) = self.snapshots.remove_temp(path) {
                warn!(path = %path.display(), error = %e, "could not remove temporary snapshot");
            }
        }
        let aborted = self.wal.lock().append_abort(&tx.id);
        if let Err(e) = aborted {
            warn!(tx_id = %tx.id, error = %e, "ABORT not recorded; recovery will roll back");
        }
        self.release_head(tx);
        tx.status = TxStatus::RolledBack;
        warn!(tx_id = %tx.id, error = %cause, "commit aborted");
        cause
    }

    /// Drop an aborted transaction's state from the sequencer head.
    ///
    /// Only when nothing was staged on top of it; later stagings abort with
    /// `CommitConflict` at their turn and release the head themselves.
    fn release_head(&self, tx: &Transaction) {
        let mut seq = self.sequencer.lock();
        if tx.post_digest == Some(seq.head_digest) {
            seq.head = self.memtable.snapshot();
            seq.head_digest = *self.committed_digest.read();
        }
    }

    /// Put the previous snapshot back after the rename, then abort.
    ///
    /// If the previous snapshot cannot be reinstalled the PREPARE is left
    /// open and the store halts: recovery undoes the publication from the
    /// pre-images in the log.
    fn undo_publication(
        &self,
        tx: &mut Transaction,
        previous: &State,
        prepared: &WalEntry,
        cause: StateError,
    ) -> StateError {
        let reinstalled = encode_state(previous)
            .and_then(|enc| self.snapshots.install(prepared.lsn, &enc.bytes));

        match reinstalled {
            Ok(()) => self.abort_prepared(tx, None, cause),
            Err(undo) => {
                error!(
                    tx_id = %tx.id,
                    error = %cause,
                    undo_error = %undo,
                    "cannot revert publication, halting"
                );
                self.halt(&cause);
                cause
            }
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn status(&self) -> EngineStatus {
        self.lifecycle.read().clone()
    }

    /// Report of the most recent recovery run
    pub fn last_recovery_report(&self) -> Option<RecoveryReport> {
        self.last_report.lock().clone()
    }

    /// Crash injection for this engine
    pub fn crash_points(&self) -> &CrashPoints {
        &self.crash_points
    }

    pub fn wal_path(&self) -> PathBuf {
        self.wal_path.clone()
    }

    pub fn snapshot_dir(&self) -> &Path {
        self.snapshots.dir()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
