//! Transaction store
//!
//! Holds the committed transaction records. All mutation goes through the
//! kernel, which serializes per transaction ID; reads run lock-free against
//! the latest committed snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use actp_types::{ActpError, Result, Transaction, TransactionId, TxState};

/// Thread-safe store of transaction records
#[derive(Clone)]
pub struct TransactionStore {
    txs: Arc<RwLock<HashMap<TransactionId, Transaction>>>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self {
            txs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a new record
    pub async fn insert(&self, tx: Transaction) {
        let mut txs = self.txs.write().await;
        txs.insert(tx.id.clone(), tx);
    }

    /// Snapshot of a record
    pub async fn get(&self, tx_id: &TransactionId) -> Result<Transaction> {
        let txs = self.txs.read().await;
        txs.get(tx_id)
            .cloned()
            .ok_or_else(|| ActpError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })
    }

    /// Replace a record with its mutated successor
    pub async fn commit(&self, tx: Transaction) {
        let mut txs = self.txs.write().await;
        txs.insert(tx.id.clone(), tx);
    }

    /// All transactions currently in the given state
    pub async fn in_state(&self, state: TxState) -> Vec<Transaction> {
        let txs = self.txs.read().await;
        txs.values().filter(|t| t.state == state).cloned().collect()
    }

    /// Number of stored transactions
    pub async fn count(&self) -> usize {
        self.txs.read().await.len()
    }
}

impl Default for TransactionStore {
    fn default() -> Self {
        Self::new()
    }
}
