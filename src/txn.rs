//! Transactions
//!
//! A transaction is owned by its caller until it is handed to
//! [`Engine::commit_transaction`](crate::Engine::commit_transaction) or
//! [`Engine::rollback_transaction`](crate::Engine::rollback_transaction).

use serde::{Deserialize, Serialize};

use crate::snapshot::Digest;
use crate::wal::Change;

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Committed,
    RolledBack,
}

/// An ordered change-set under construction
///
/// Not `Clone`: a copy could be committed a second time under the same id.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: String,
    pub(crate) changes: Vec<Change>,
    pub(crate) pre_digest: Option<Digest>,
    pub(crate) post_digest: Option<Digest>,
    pub(crate) status: TxStatus,
    pub(crate) prepare_lsn: Option<u64>,
}

impl Transaction {
    pub(crate) fn new(id: String) -> Self {
        Self {
            id,
            changes: Vec::new(),
            pre_digest: None,
            post_digest: None,
            status: TxStatus::Pending,
            prepare_lsn: None,
        }
    }

    /// Stage `key = value`
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.changes.push(Change::put(key, value.into()));
        self
    }

    /// Stage removal of `key`
    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.changes.push(Change::delete(key));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Digest of the state this transaction was staged against (set at commit)
    pub fn pre_digest(&self) -> Option<Digest> {
        self.pre_digest
    }

    /// Digest of the snapshot this transaction publishes (set at commit)
    pub fn post_digest(&self) -> Option<Digest> {
        self.post_digest
    }

    /// LSN of the PREPARE record, once written
    pub fn prepare_lsn(&self) -> Option<u64> {
        self.prepare_lsn
    }
}

/// Proof of a completed commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitReceipt {
    pub tx_id: String,
    pub prepare_lsn: u64,
    pub commit_lsn: u64,
    pub digest: Digest,
}
