use crate::core::Transaction;
use data_encoding::HEXLOWER;
use std::collections::HashMap;
use std::sync::RwLock;

/// Pending transactions, ( K -> txid_hex, V => Transaction ).
///
/// `add` does not validate; callers verify before inserting. Nothing is
/// evicted, expired, ordered or persisted.
pub struct MemoryPool {
    inner: RwLock<HashMap<String, Transaction>>,
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPool {
    pub fn new() -> MemoryPool {
        MemoryPool {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, txid_hex: &str) -> Option<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.get(txid_hex).cloned(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                None
            }
        }
    }

    /// Inserts or overwrites by id.
    pub fn add(&self, tx: Transaction) {
        match self.inner.write() {
            Ok(mut pool) => {
                pool.insert(tx.get_id_hex(), tx);
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    pub fn has(&self, txid_hex: &str) -> bool {
        match self.inner.read() {
            Ok(pool) => pool.contains_key(txid_hex),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                false
            }
        }
    }

    /// Ids of every pending transaction, in no particular order.
    pub fn get_all_hashes(&self) -> Vec<Vec<u8>> {
        match self.inner.read() {
            Ok(pool) => pool.values().map(|tx| tx.get_id().to_vec()).collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                Vec::new()
            }
        }
    }

    pub fn get_all(&self) -> Vec<Transaction> {
        match self.inner.read() {
            Ok(pool) => pool.values().cloned().collect(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                Vec::new()
            }
        }
    }

    pub fn remove(&self, txid_hex: &str) {
        match self.inner.write() {
            Ok(mut pool) => {
                pool.remove(txid_hex);
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    /// Drops every transaction a committed block now carries.
    pub fn remove_included(&self, transactions: &[Transaction]) {
        match self.inner.write() {
            Ok(mut pool) => {
                for tx in transactions {
                    pool.remove(&HEXLOWER.encode(tx.get_id()));
                }
            }
            Err(_) => {
                log::error!("Failed to acquire write lock on memory pool");
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(pool) => pool.len(),
            Err(_) => {
                log::error!("Failed to acquire read lock on memory pool");
                0
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
