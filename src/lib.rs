//! # statecore
//!
//! A durable state core with:
//! - Write-Ahead Logging (WAL) with per-record checksums
//! - Atomic commits published by rename and vouched for by a digest
//! - Crash recovery that reconciles the WAL with the snapshot directory
//! - Per-thread CPU accounting with threshold violation detection
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionMonitor                         │
//! │        (CPU tracking window around each commit)              │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//! ┌──────────────▼──────────────┐   ┌───────────▼───────────────┐
//! │           Engine            │   │    ThreadCpuAccounting     │
//! │  (commit protocol, halt)    │   │  (one platform CpuClock)   │
//! └──────┬──────────┬───────────┘   └───────────────────────────┘
//!        │          │
//!        ▼          ▼
//!   ┌─────────┐ ┌─────────┐   ┌──────────────┐
//!   │   WAL   │ │MemTable │   │ SnapshotStore│
//!   │(Append) │ │(RwLock) │   │ (tmp→rename) │
//!   └────┬────┘ └─────────┘   └──────┬───────┘
//!        │                           │
//!        └─────────┬─────────────────┘
//!                  ▼
//!          ┌───────────────┐
//!          │RecoveryManager│
//!          │  (startup)    │
//!          └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod durability;
pub mod wal;
pub mod memtable;
pub mod snapshot;
pub mod crash_point;
pub mod txn;
pub mod recovery;
pub mod engine;

pub mod cpu;
pub mod monitor;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StateError};
pub use config::{Config, SyncMode, ViolationPolicy};
pub use engine::{Engine, EngineStatus};
pub use txn::{CommitReceipt, Transaction, TxStatus};
pub use snapshot::Digest;
pub use recovery::{DigestCheck, RecoveryReport};
pub use crash_point::{CrashPoint, Fault};
pub use cpu::{ThreadCpuAccounting, ThreadHandle};
pub use monitor::{TransactionMonitor, ViolationEvent, ViolationSink};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of statecore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
