//! WAL Entry definitions
//!
//! Defines the structure of individual WAL records and their line framing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Result, StateError};
use crate::snapshot::Digest;

/// Unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Record tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Change-set is durable, publication may follow
    Prepare,

    /// Publication completed; carries the committed snapshot digest
    Commit,

    /// Transaction will never publish
    Abort,
}

impl Operation {
    pub fn is_terminal(self) -> bool {
        matches!(self, Operation::Commit | Operation::Abort)
    }
}

/// A single key change. `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub key: String,

    pub value: Option<Vec<u8>>,

    /// Value the key held before this change, filled in when staged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Vec<u8>>,
}

impl Change {
    pub fn put(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            previous: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            previous: None,
        }
    }
}

/// A single record in the WAL
///
/// Records are immutable once appended; a status change is a new record
/// with the same `tx_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing
    pub lsn: u64,

    /// Record tag
    pub op: Operation,

    /// Transaction the record belongs to
    pub tx_id: String,

    /// Change-set (PREPARE, or COMMIT in a compacted log)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<Change>,

    /// Unix millis when the record was created
    pub timestamp: u64,

    /// True only on COMMIT records
    pub committed: bool,

    /// Digest of the state the change-set was staged against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_digest: Option<Digest>,

    /// Digest of the snapshot this transaction publishes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_digest: Option<Digest>,

    /// COMMIT replaces the whole state instead of applying on top of it
    #[serde(default, skip_serializing_if = "is_false")]
    pub reset: bool,

    /// Byte offset of the record in the file it was read from or written to
    #[serde(skip)]
    pub offset: u64,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// On-disk framing: `{"crc":<crc32 of entry json>,"entry":{...}}\n`
#[derive(Deserialize)]
struct Frame<'a> {
    crc: u32,
    #[serde(borrow)]
    entry: &'a RawValue,
}

impl WalEntry {
    /// Unsequenced record; the writer assigns lsn, timestamp and offset
    pub fn new(op: Operation, tx_id: impl Into<String>) -> Self {
        Self {
            lsn: 0,
            op,
            tx_id: tx_id.into(),
            changes: Vec::new(),
            timestamp: 0,
            committed: op == Operation::Commit,
            pre_digest: None,
            post_digest: None,
            reset: false,
            offset: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.op.is_terminal()
    }

    /// Encode as one framed line, newline included
    pub fn encode_line(&self) -> Result<String> {
        let body = serde_json::to_string(self)?;
        let crc = crc32fast::hash(body.as_bytes());
        Ok(format!("{{\"crc\":{},\"entry\":{}}}\n", crc, body))
    }

    /// Decode one framed line (with or without its trailing newline)
    pub fn decode_line(line: &str) -> Result<Self> {
        let frame: Frame<'_> = serde_json::from_str(line.trim_end())
            .map_err(|e| StateError::WalCorruption(format!("unreadable frame: {}", e)))?;

        let body = frame.entry.get();
        let actual = crc32fast::hash(body.as_bytes());
        if actual != frame.crc {
            return Err(StateError::WalCorruption(format!(
                "CRC mismatch: stored {:08x}, computed {:08x}",
                frame.crc, actual
            )));
        }

        serde_json::from_str(body)
            .map_err(|e| StateError::WalCorruption(format!("unreadable entry: {}", e)))
    }
}
