//! Data storage and persistence
//!
//! Typed sled keys, the unspent-output index derived from the ledger, and
//! the in-memory pool of pending transactions.

pub mod keys;
pub mod memory_pool;
pub mod utxo_set;

pub use keys::{StoreKey, BLOCKS_TREE, CHAINSTATE_TREE};
pub use memory_pool::MemoryPool;
pub use utxo_set::{UTXOSet, UnspentOutput};
