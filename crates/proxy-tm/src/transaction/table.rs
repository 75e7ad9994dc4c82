use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::cell::Transaction;
use super::key::{BranchLabel, TransactionKey};
use crate::error::{Error, Result};

/// Lookup table of live transactions.
///
/// Requests are matched by [`TransactionKey`], replies by the label encoded
/// in the branch id of the Via this proxy added.
#[derive(Debug)]
pub struct TransactionTable {
    by_key: DashMap<TransactionKey, Arc<Transaction>>,
    by_label: DashMap<u64, Arc<Transaction>>,
    next_label: AtomicU64,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_label: DashMap::new(),
            next_label: AtomicU64::new(u64::from(rand::random::<u32>())),
        }
    }

    pub(crate) fn next_label(&self) -> u64 {
        self.next_label.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts `tx`, failing if a transaction with the same key exists.
    pub fn insert(&self, tx: Arc<Transaction>) -> Result<()> {
        match self.by_key.entry(tx.key().clone()) {
            Entry::Occupied(_) => Err(Error::TransactionExists(tx.key().clone())),
            Entry::Vacant(slot) => {
                self.by_label.insert(tx.label(), tx.clone());
                slot.insert(tx);
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &TransactionKey) -> Option<Arc<Transaction>> {
        self.by_key.get(key).map(|e| e.value().clone())
    }

    /// Finds the transaction and branch index a reply belongs to.
    pub fn lookup_reply(&self, branch_id: &str) -> Option<(Arc<Transaction>, usize)> {
        let label = BranchLabel::parse(branch_id)?;
        let tx = self.by_label.get(&label.label).map(|e| e.value().clone())?;
        if tx.hash() != label.hash || label.branch >= tx.branch_count() {
            return None;
        }
        Some((tx, label.branch))
    }

    /// Unlinks `tx` from both indexes. Returns whether it was present.
    pub fn remove(&self, tx: &Transaction) -> bool {
        let removed = self
            .by_key
            .remove_if(tx.key(), |_, existing| existing.label() == tx.label())
            .is_some();
        self.by_label.remove(&tx.label());
        removed
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}
