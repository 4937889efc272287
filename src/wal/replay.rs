//! Log interpretation
//!
//! Pure functions over a scanned log: rebuild state, find unresolved
//! transactions, locate the COMMIT that vouches for the canonical snapshot.

use std::collections::{HashMap, HashSet};

use crate::memtable::{apply_changes, State};

use super::{Change, Operation, WalEntry};

/// Rebuild the committed state described by a log.
///
/// A COMMIT applies its own change-set when it carries one (compacted logs,
/// checkpoint restores) and otherwise the change-set of its PREPARE.
pub fn replay(entries: &[WalEntry]) -> State {
    let mut state = State::new();
    let mut prepared: HashMap<&str, &[Change]> = HashMap::new();

    for entry in entries {
        match entry.op {
            Operation::Prepare => {
                prepared.insert(entry.tx_id.as_str(), &entry.changes);
            }
            Operation::Commit => {
                let changes = if entry.reset || !entry.changes.is_empty() {
                    &entry.changes[..]
                } else {
                    prepared.remove(entry.tx_id.as_str()).unwrap_or(&[])
                };
                if entry.reset {
                    state.clear();
                }
                let mut changes = changes.to_vec();
                apply_changes(&mut state, &mut changes);
            }
            Operation::Abort => {
                prepared.remove(entry.tx_id.as_str());
            }
        }
    }

    state
}

/// PREPARE records without a later COMMIT or ABORT, in log order
pub fn pending_transactions(entries: &[WalEntry]) -> Vec<WalEntry> {
    let mut open: HashMap<&str, &WalEntry> = HashMap::new();
    for entry in entries {
        if entry.op == Operation::Prepare {
            open.insert(entry.tx_id.as_str(), entry);
        } else {
            open.remove(entry.tx_id.as_str());
        }
    }

    let mut pending: Vec<WalEntry> = open.into_values().cloned().collect();
    pending.sort_by_key(|e| e.lsn);
    pending
}

/// The most recent COMMIT record
pub fn last_commit(entries: &[WalEntry]) -> Option<&WalEntry> {
    entries.iter().rev().find(|e| e.op == Operation::Commit)
}

/// Every transaction id the log mentions
pub fn transaction_ids(entries: &[WalEntry]) -> HashSet<String> {
    entries.iter().map(|e| e.tx_id.clone()).collect()
}
