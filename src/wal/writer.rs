//! WAL Writer
//!
//! Appends records and forces each one to stable storage before returning.
//! The writer keeps its own cursor (next LSN, byte offset), so an append
//! never rereads the file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::SyncMode;
use crate::durability::{sync_dir, sync_file};
use crate::error::{Result, StateError};
use crate::snapshot::Digest;

use super::reader::{ScanStats, WalReader, WalScan};
use super::replay::pending_transactions;
use super::{now_millis, Change, Operation, WalEntry};

/// Writes entries to the WAL file
pub struct WalWriter {
    pub(super) path: PathBuf,
    pub(super) file: File,
    pub(super) next_lsn: u64,
    pub(super) offset: u64,
    pub(super) sync_mode: SyncMode,
    pub(super) open_stats: Option<ScanStats>,
}

impl WalWriter {
    /// Open or create a WAL file.
    ///
    /// Scans the existing log once to position the cursor and cuts off a
    /// torn tail left by an interrupted append.
    pub fn open(path: &Path, sync_mode: SyncMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let existed = path.exists();
        let scan = WalReader::scan(path)?;

        if scan.stats.was_truncated {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.stats.valid_len)?;
            sync_file(&file, sync_mode, path)?;
            tracing::warn!(
                path = %path.display(),
                valid_len = scan.stats.valid_len,
                "truncated torn WAL tail"
            );
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if !existed {
            if let Some(parent) = path.parent() {
                sync_dir(parent)?;
            }
        }

        let last_lsn = scan.entries.iter().map(|e| e.lsn).max().unwrap_or(0);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_lsn: last_lsn + 1,
            offset: scan.stats.valid_len,
            sync_mode,
            open_stats: Some(scan.stats),
        })
    }

    /// Append a PREPARE record for `tx_id`
    pub fn append(&mut self, tx_id: &str, changes: Vec<Change>) -> Result<WalEntry> {
        let mut entry = WalEntry::new(Operation::Prepare, tx_id);
        entry.changes = changes;
        self.append_record(entry)
    }

    /// Append a PREPARE record that also names the digests it moves between
    pub fn append_prepared(
        &mut self,
        tx_id: &str,
        changes: Vec<Change>,
        pre_digest: Digest,
        post_digest: Digest,
    ) -> Result<WalEntry> {
        let mut entry = WalEntry::new(Operation::Prepare, tx_id);
        entry.changes = changes;
        entry.pre_digest = Some(pre_digest);
        entry.post_digest = Some(post_digest);
        self.append_record(entry)
    }

    /// Append a COMMIT record for the transaction `prepared` belongs to
    pub fn mark_committed(&mut self, prepared: &WalEntry, digest: Digest) -> Result<WalEntry> {
        let mut entry = WalEntry::new(Operation::Commit, prepared.tx_id.clone());
        entry.pre_digest = prepared.pre_digest;
        entry.post_digest = Some(digest);
        self.append_record(entry)
    }

    /// Append an ABORT record
    pub fn append_abort(&mut self, tx_id: &str) -> Result<WalEntry> {
        self.append_record(WalEntry::new(Operation::Abort, tx_id))
    }

    /// Append a COMMIT that replaces the whole state with `changes`
    pub fn append_reset(
        &mut self,
        tx_id: &str,
        changes: Vec<Change>,
        digest: Digest,
    ) -> Result<WalEntry> {
        let mut entry = WalEntry::new(Operation::Commit, tx_id);
        entry.changes = changes;
        entry.post_digest = Some(digest);
        entry.reset = true;
        self.append_record(entry)
    }

    fn append_record(&mut self, mut entry: WalEntry) -> Result<WalEntry> {
        entry.lsn = self.next_lsn;
        entry.timestamp = now_millis();
        entry.offset = self.offset;

        let line = entry.encode_line()?;

        if let Err(source) = self.file.write_all(line.as_bytes()) {
            let _ = self.file.set_len(self.offset);
            return Err(StateError::DurableWriteFailure {
                path: self.path.clone(),
                source,
            });
        }
        if let Err(e) = sync_file(&self.file, self.sync_mode, &self.path) {
            let _ = self.file.set_len(self.offset);
            return Err(e);
        }

        self.next_lsn += 1;
        self.offset += line.len() as u64;

        tracing::trace!(lsn = entry.lsn, op = ?entry.op, tx_id = %entry.tx_id, "WAL append");
        Ok(entry)
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> Result<()> {
        sync_file(&self.file, self.sync_mode, &self.path)
    }

    /// PREPARE records with no COMMIT/ABORT, in log order
    pub fn list_uncommitted(&self) -> Result<Vec<WalEntry>> {
        Ok(pending_transactions(&self.scan()?.entries))
    }

    /// Read the whole log
    pub fn scan(&self) -> Result<WalScan> {
        WalReader::scan(&self.path)
    }

    /// Stats from the scan done at open; returned once
    pub fn take_open_stats(&mut self) -> Option<ScanStats> {
        self.open_stats.take()
    }

    /// The LSN the next append will receive
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn
    }

    /// Current end of the log in bytes
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
