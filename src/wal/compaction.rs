//! WAL compaction
//!
//! Maintenance only: never called from the commit path. The compacted log
//! keeps one record per transaction, its latest status, with the PREPARE
//! change-set and digests carried onto a COMMIT so replay still works.
//! The new log is written beside the old one, flushed, and renamed over it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};

use serde::Serialize;

use crate::durability::{rename_atomic, sync_file};
use crate::error::{Result, StateError};

use super::reader::WalReader;
use super::{Operation, WalEntry, WalWriter};

/// What a compaction pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub entries_before: usize,
    pub entries_after: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactionStats {
    pub fn entries_removed(&self) -> usize {
        self.entries_before - self.entries_after
    }
}

/// Reduce a log to the latest status per transaction, in the order those
/// latest records appear.
pub fn compact_entries(entries: &[WalEntry]) -> Vec<WalEntry> {
    let mut prepared: HashMap<&str, &WalEntry> = HashMap::new();
    let mut latest: HashMap<&str, (usize, WalEntry)> = HashMap::new();

    for (position, entry) in entries.iter().enumerate() {
        let mut kept = entry.clone();
        match entry.op {
            Operation::Prepare => {
                prepared.insert(entry.tx_id.as_str(), entry);
            }
            Operation::Commit | Operation::Abort => {
                if let Some(prepare) = prepared.get(entry.tx_id.as_str()) {
                    if entry.op == Operation::Commit && kept.changes.is_empty() && !kept.reset {
                        kept.changes = prepare.changes.clone();
                    }
                    kept.pre_digest = kept.pre_digest.or(prepare.pre_digest);
                    kept.post_digest = kept.post_digest.or(prepare.post_digest);
                }
            }
        }
        latest.insert(entry.tx_id.as_str(), (position, kept));
    }

    let mut kept: Vec<(usize, WalEntry)> = latest.into_values().collect();
    kept.sort_by_key(|(position, _)| *position);
    kept.into_iter().map(|(_, entry)| entry).collect()
}

impl WalWriter {
    /// Rewrite the log keeping only the latest status per transaction.
    ///
    /// Refuses to run over corrupted records, since compaction would drop them
    /// silently.
    pub fn compact(&mut self) -> Result<CompactionStats> {
        let scan = WalReader::scan(&self.path)?;
        if scan.stats.entries_corrupted > 0 {
            return Err(StateError::WalCorruption(format!(
                "refusing to compact {} with {} corrupted records",
                self.path.display(),
                scan.stats.entries_corrupted
            )));
        }

        let compacted = compact_entries(&scan.entries);
        let tmp_path = self.path.with_extension("log.compact");

        let mut written = 0u64;
        {
            let file = File::create(&tmp_path).map_err(|source| {
                StateError::DurableWriteFailure {
                    path: tmp_path.clone(),
                    source,
                }
            })?;
            let mut writer = BufWriter::new(file);
            for entry in &compacted {
                let line = entry.encode_line()?;
                writer.write_all(line.as_bytes())?;
                written += line.len() as u64;
            }
            let file = writer
                .into_inner()
                .map_err(|e| StateError::DurableWriteFailure {
                    path: tmp_path.clone(),
                    source: e.into_error(),
                })?;
            sync_file(&file, self.sync_mode, &tmp_path)?;
        }

        // Opened before the rename so a failure leaves the old log in use
        let appender = match OpenOptions::new().append(true).open(&tmp_path) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };
        if let Err(e) = rename_atomic(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        self.file = appender;
        self.offset = written;

        let stats = CompactionStats {
            entries_before: scan.entries.len(),
            entries_after: compacted.len(),
            bytes_before: scan.stats.valid_len,
            bytes_after: written,
        };
        tracing::info!(
            before = stats.entries_before,
            after = stats.entries_after,
            bytes_after = stats.bytes_after,
            "WAL compacted"
        );
        Ok(stats)
    }
}
