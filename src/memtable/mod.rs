//! MemTable Module
//!
//! In-memory key/value index that mirrors the canonical snapshot.
//!
//! ## Responsibilities
//! - Lock-light reads of the last committed state
//! - Staging a change-set against a private copy
//! - Publishing a staged copy once its commit is durable
//! - Undoing a change-set from recorded pre-images
//!
//! ## Data Structure Choice
//! `BTreeMap` behind an `Arc`: ordered keys give a deterministic snapshot
//! encoding, and readers clone the `Arc` instead of holding a lock.

mod table;

use std::collections::BTreeMap;

pub use table::{apply_changes, undo_changes, MemTable};

/// The full key/value state
pub type State = BTreeMap<String, Vec<u8>>;
