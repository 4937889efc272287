//! WAL Reader
//!
//! Single linear pass over the log. A torn final line (no newline, or a
//! frame that fails to decode at the very end) is treated as an interrupted
//! append and ends the scan; a bad frame with valid data after it is counted
//! as corrupted and skipped.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use crate::error::{Result, StateError};

use super::WalEntry;

/// Statistics from one pass over the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Records decoded successfully
    pub entries_read: u64,

    /// Records skipped because their frame or CRC was bad
    pub entries_corrupted: u64,

    /// LSN of the last good record (0 if none)
    pub last_lsn: u64,

    /// A torn tail was found after `valid_len`
    pub was_truncated: bool,

    /// Length of the file prefix made of complete lines
    pub valid_len: u64,
}

/// Every record of a log plus the pass statistics
#[derive(Debug, Default)]
pub struct WalScan {
    pub entries: Vec<WalEntry>,
    pub stats: ScanStats,
}

/// Reads entries from the WAL file
pub struct WalReader {
    reader: BufReader<File>,
    position: u64,
    stats: ScanStats,
    done: bool,
}

impl WalReader {
    /// Open a WAL file for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            position: 0,
            stats: ScanStats::default(),
            done: false,
        })
    }

    /// Read every record of the log at `path`; a missing file is an empty log
    pub fn scan(path: &Path) -> Result<WalScan> {
        let mut reader = match Self::open(path) {
            Ok(r) => r,
            Err(StateError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Ok(WalScan::default())
            }
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry()? {
            entries.push(entry);
        }
        Ok(WalScan {
            entries,
            stats: reader.stats,
        })
    }

    /// Read the next entry from the WAL
    pub fn next_entry(&mut self) -> Result<Option<WalEntry>> {
        loop {
            if self.done {
                return Ok(None);
            }

            let mut line = Vec::new();
            let n = self.reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                self.done = true;
                return Ok(None);
            }

            let start = self.position;
            self.position += n as u64;

            if line.last() != Some(&b'\n') {
                tracing::warn!(offset = start, bytes = n, "torn WAL tail");
                self.stats.was_truncated = true;
                self.done = true;
                return Ok(None);
            }

            let decoded = std::str::from_utf8(&line)
                .map_err(|e| StateError::WalCorruption(format!("non-UTF-8 record: {}", e)))
                .and_then(WalEntry::decode_line);

            match decoded {
                Ok(mut entry) => {
                    entry.offset = start;
                    self.stats.entries_read += 1;
                    self.stats.last_lsn = entry.lsn;
                    self.stats.valid_len = self.position;
                    return Ok(Some(entry));
                }
                Err(err) => {
                    if self.reader.fill_buf()?.is_empty() {
                        tracing::warn!(offset = start, error = %err, "unreadable final WAL record");
                        self.stats.was_truncated = true;
                        self.done = true;
                        return Ok(None);
                    }
                    tracing::warn!(offset = start, error = %err, "skipping corrupted WAL record");
                    self.stats.entries_corrupted += 1;
                    self.stats.valid_len = self.position;
                }
            }
        }
    }

    /// Statistics so far
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Iterate over all valid entries
    pub fn entries(self) -> WalIterator {
        WalIterator { reader: self }
    }
}

/// Iterator over WAL entries
pub struct WalIterator {
    reader: WalReader,
}

impl Iterator for WalIterator {
    type Item = Result<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_entry().transpose()
    }
}
