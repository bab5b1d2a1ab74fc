use std::collections::HashMap;
use std::sync::RwLock;

use minibit_primitives::{hash_to_hex, Block, Transaction};

/// Pending transactions keyed by hex txid. Validation happens at the
/// call sites; the pool itself only deduplicates.
#[derive(Default)]
pub struct Mempool {
    transactions: RwLock<HashMap<String, Transaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true iff the transaction was newly inserted.
    pub fn add(&self, tx: Transaction) -> bool {
        let txid = hash_to_hex(&tx.id);
        let mut transactions = self.write();
        if transactions.contains_key(&txid) {
            return false;
        }
        transactions.insert(txid, tx);
        true
    }

    pub fn get(&self, txid: &str) -> Option<Transaction> {
        self.read().get(txid).cloned()
    }

    pub fn exists(&self, txid: &str) -> bool {
        self.read().contains_key(txid)
    }

    /// Snapshot of every pending transaction; the pool keeps them.
    pub fn drain(&self) -> Vec<Transaction> {
        self.read().values().cloned().collect()
    }

    pub fn remove(&self, txid: &str) {
        self.write().remove(txid);
    }

    /// Removes every transaction contained in the block.
    pub fn clear_block(&self, block: &Block) {
        let mut transactions = self.write();
        for tx in &block.transactions {
            transactions.remove(&hash_to_hex(&tx.id));
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Transaction>> {
        match self.transactions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Transaction>> {
        match self.transactions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
