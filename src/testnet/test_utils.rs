//! Test utilities for blockchain testing

use crate::core::{Block, Blockchain, Transaction};
use crate::storage::UTXOSet;
use crate::wallet::Wallet;
use tempfile::TempDir;

/// Low enough to mine a block in a few hundred hashes
pub const TEST_DIFFICULTY: u32 = 8;

/// A ledger whose genesis reward belongs to `miner`.
pub struct TestChain {
    pub blockchain: Blockchain,
    pub miner: Wallet,
    _dir: TempDir,
}

impl TestChain {
    pub fn new() -> TestChain {
        let dir = TempDir::new().unwrap();
        let miner = Wallet::new().unwrap();
        let blockchain =
            Blockchain::create_blockchain(dir.path(), &miner.get_address(), TEST_DIFFICULTY)
                .unwrap();
        TestChain {
            blockchain,
            miner,
            _dir: dir,
        }
    }

    /// Signed payment from `miner` to `to`.
    pub fn pay(&self, to: &str, amount: u64) -> Transaction {
        let utxo_set = UTXOSet::new(self.blockchain.clone());
        Transaction::new_utxo_transaction(&self.miner, to, amount, &utxo_set).unwrap()
    }

    /// Mines `transactions` behind a coinbase paid to a fresh address, so the
    /// miner's balance only moves through its own payments.
    pub fn mine_with(&self, transactions: Vec<Transaction>) -> Block {
        let reward_address = Wallet::new().unwrap().get_address();
        let mut block_txs = vec![Transaction::new_coinbase_tx(&reward_address, "").unwrap()];
        block_txs.extend(transactions);
        self.blockchain.mine_block(&block_txs).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_chain_has_genesis() {
        let chain = TestChain::new();
        assert_eq!(chain.blockchain.get_best_height().unwrap(), 1);
        assert_eq!(chain.blockchain.get_difficulty(), TEST_DIFFICULTY);
    }

    #[test]
    fn test_fixture_payment_moves_balance() {
        let chain = TestChain::new();
        let recipient = Wallet::new().unwrap();
        chain.mine_with(vec![chain.pay(&recipient.get_address(), 20)]);

        let utxo_set = UTXOSet::new(chain.blockchain.clone());
        assert_eq!(utxo_set.get_balance(&recipient.get_pub_key_hash()).unwrap(), 20);
        assert_eq!(utxo_set.get_balance(&chain.miner.get_pub_key_hash()).unwrap(), 30);
    }
}
