//! MemTable implementation
//!
//! `Arc<State>` swapped under a `parking_lot::RwLock`.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::wal::Change;

use super::State;

/// In-memory index of committed state
pub struct MemTable {
    current: RwLock<Arc<State>>,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(State::new())),
        }
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.current.read().get(key).cloned()
    }

    /// Shared handle to the current state
    pub fn snapshot(&self) -> Arc<State> {
        Arc::clone(&self.current.read())
    }

    /// Make `state` the visible state
    pub fn publish(&self, state: impl Into<Arc<State>>) {
        *self.current.write() = state.into();
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply changes in order, recording pre-images
pub fn apply_changes(state: &mut State, changes: &mut [Change]) {
    for change in changes.iter_mut() {
        change.previous = match &change.value {
            Some(v) => state.insert(change.key.clone(), v.clone()),
            None => state.remove(&change.key),
        };
    }
}

/// Revert changes in reverse order using their pre-images
pub fn undo_changes(state: &mut State, changes: &[Change]) {
    for change in changes.iter().rev() {
        match &change.previous {
            Some(v) => {
                state.insert(change.key.clone(), v.clone());
            }
            None => {
                state.remove(&change.key);
            }
        }
    }
}
