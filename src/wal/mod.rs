//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append PREPARE / COMMIT / ABORT records, each flushed before returning
//! - CRC32 checksums for torn-write and corruption detection
//! - Log Sequence Numbers (LSN) for ordering
//! - Single-pass scans for recovery and replay
//! - Out-of-band compaction
//!
//! ## File Format
//! One self-contained JSON record per line:
//! ```text
//! {"crc":3735928559,"entry":{"lsn":1,"op":"PREPARE","tx_id":"t1","changes":[..],"timestamp":..,"committed":false,..}}
//! {"crc":2343432205,"entry":{"lsn":2,"op":"COMMIT","tx_id":"t1","timestamp":..,"committed":true,"post_digest":"9f2c.."}}
//! ```
//! Records are never edited; a status change is a new line.

mod compaction;
mod entry;
mod reader;
mod replay;
mod writer;

pub use compaction::{compact_entries, CompactionStats};
pub use entry::{now_millis, Change, Operation, WalEntry};
pub use reader::{ScanStats, WalIterator, WalReader, WalScan};
pub use replay::{last_commit, pending_transactions, replay, transaction_ids};
pub use writer::WalWriter;
