// The ledger: blocks keyed by hash in sled, plus the tip pointer under "l".
// The unspent-output index lives in a second tree and is updated in the same
// storage transaction that appends a block, so no reader ever sees a tip
// without its block or an index ahead of the chain.

use crate::core::{Block, OutPoint, PrevOutputs, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::utxo_set::apply_block;
use crate::storage::{StoreKey, UTXOSet, UnspentOutput, BLOCKS_TREE, CHAINSTATE_TREE};
use data_encoding::HEXLOWER;
use log::{error, info, warn};
use sled::transaction::{abort, ConflictableTransactionResult};
use sled::{Db, Transactional, Tree};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// What happened to a block offered by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Validated, appended and indexed.
    Committed,
    /// Already stored; nothing to do.
    AlreadyKnown,
    /// Its parent is not our tip. There is no fork handling, so it is dropped.
    NotExtendingTip,
}

#[derive(Clone)]
pub struct Blockchain {
    db: Db,
    blocks: Tree,
    chainstate: Tree,
    difficulty: u32,
    db_path: PathBuf,
}

impl Blockchain {
    /// Opens (or creates) the store at `path`. The ledger may be empty; an
    /// empty ledger accepts a block with an empty parent hash as genesis.
    pub fn open(path: impl AsRef<Path>, difficulty: u32) -> Result<Blockchain> {
        let db_path = path.as_ref().to_path_buf();
        let db = sled::open(&db_path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        let blocks = db
            .open_tree(BLOCKS_TREE)
            .map_err(|e| BlockchainError::Database(format!("Failed to open blocks tree: {e}")))?;
        let chainstate = db.open_tree(CHAINSTATE_TREE).map_err(|e| {
            BlockchainError::Database(format!("Failed to open chainstate tree: {e}"))
        })?;

        Ok(Blockchain {
            db,
            blocks,
            chainstate,
            difficulty,
            db_path,
        })
    }

    /// Opens the store and mines a genesis block paying `genesis_address`.
    /// Refuses to touch a store that already holds a chain.
    pub fn create_blockchain(
        path: impl AsRef<Path>,
        genesis_address: &str,
        difficulty: u32,
    ) -> Result<Blockchain> {
        let blockchain = Self::open(path, difficulty)?;
        if !blockchain.is_empty()? {
            return Err(BlockchainError::Database(format!(
                "Blockchain already exists at {}",
                blockchain.db_path.display()
            )));
        }

        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, "genesis")?;
        let genesis = Block::generate_genesis_block(&coinbase_tx, difficulty)?;
        blockchain.commit_block(&genesis)?;
        Ok(blockchain)
    }

    pub fn get_chainstate(&self) -> &Tree {
        &self.chainstate
    }

    pub fn get_difficulty(&self) -> u32 {
        self.difficulty
    }

    /// Hash of the last accepted block, empty when the ledger is empty.
    /// Always read from storage, never cached.
    pub fn get_tip_hash(&self) -> Result<Vec<u8>> {
        Ok(self
            .blocks
            .get(StoreKey::Tip.as_bytes())?
            .map(|tip| tip.to_vec())
            .unwrap_or_default())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.get_tip_hash()?.is_empty())
    }

    pub fn has_block(&self, hash: &[u8]) -> Result<bool> {
        Ok(self.blocks.contains_key(StoreKey::Block(hash).as_bytes())?)
    }

    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>> {
        match self.blocks.get(StoreKey::Block(hash).as_bytes())? {
            Some(bytes) => Ok(Some(Block::deserialize(bytes.as_ref())?)),
            None => Ok(None),
        }
    }

    /// Every block hash from genesis to tip.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut hashes: Vec<Vec<u8>> = self
            .iterator()?
            .map(|block| block.get_hash().to_vec())
            .collect();
        hashes.reverse();
        Ok(hashes)
    }

    /// Number of blocks reachable from the tip.
    pub fn get_best_height(&self) -> Result<usize> {
        Ok(self.iterator()?.count())
    }

    pub fn iterator(&self) -> Result<BlockchainIterator> {
        Ok(BlockchainIterator::new(
            self.get_tip_hash()?,
            self.blocks.clone(),
        ))
    }

    /// Builds a block on top of the tip from `transactions` (coinbase first),
    /// mines it and commits it. Fails with `StaleTip` if another block was
    /// committed while mining.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        let mut block = Block::new_block(self.get_tip_hash()?, transactions)?;
        block.validate_transactions()?;
        self.verify_block_transactions(&block)?;

        block.mine(self.difficulty)?;
        self.commit_block(&block)?;
        info!("Successfully mined block: {}", block.get_hash_hex());
        Ok(block)
    }

    /// Takes a block from a peer. Only a block whose parent is our tip is
    /// validated and committed.
    pub fn accept_block(&self, block: &Block) -> Result<AcceptOutcome> {
        if self.has_block(block.get_hash())? {
            return Ok(AcceptOutcome::AlreadyKnown);
        }
        if block.get_pre_block_hash() != self.get_tip_hash()?.as_slice() {
            return Ok(AcceptOutcome::NotExtendingTip);
        }

        block.validate_structure(self.difficulty)?;
        self.verify_block_transactions(block)?;

        match self.commit_block(block) {
            Ok(()) => {
                info!("Accepted block {}", block.get_hash_hex());
                Ok(AcceptOutcome::Committed)
            }
            Err(BlockchainError::StaleTip(_)) => Ok(AcceptOutcome::NotExtendingTip),
            Err(e) => Err(e),
        }
    }

    /// Checks signatures, ownership and value of every non-coinbase
    /// transaction against the index plus outputs created earlier in the
    /// same block.
    fn verify_block_transactions(&self, block: &Block) -> Result<()> {
        let utxo_set = UTXOSet::new(self.clone());
        let mut created = PrevOutputs::new();

        for tx in block.get_transactions() {
            if !tx.is_coinbase() {
                let mut prev_outputs = PrevOutputs::new();
                for out_point in tx.spent_outpoints()? {
                    let output = match created.remove(&out_point) {
                        Some(output) => output,
                        None => utxo_set.find_output(&out_point)?.ok_or_else(|| {
                            BlockchainError::Transaction(format!(
                                "Transaction {} spends unknown or spent output {}:{}",
                                tx.get_id_hex(),
                                HEXLOWER.encode(&out_point.txid),
                                out_point.vout
                            ))
                        })?,
                    };
                    prev_outputs.insert(out_point, output);
                }

                if !tx.verify(&prev_outputs)? {
                    return Err(BlockchainError::Transaction(format!(
                        "Transaction {} has an invalid signature",
                        tx.get_id_hex()
                    )));
                }
                if !tx.verify_balance(&prev_outputs)? {
                    return Err(BlockchainError::Transaction(format!(
                        "Transaction {} spends more than its inputs",
                        tx.get_id_hex()
                    )));
                }
            }

            for (vout, output) in tx.get_vout().iter().enumerate() {
                created.insert(OutPoint::new(tx.get_id(), vout), output.clone());
            }
        }
        Ok(())
    }

    /// Block, tip pointer and index update in one transaction over both
    /// trees. Aborts with `StaleTip` when the block's parent is no longer the
    /// stored tip.
    fn commit_block(&self, block: &Block) -> Result<()> {
        let block_data = block.serialize()?;
        let block_hash = block.get_hash();

        (&self.blocks, &self.chainstate).transaction(
            |(blocks, chainstate)| -> ConflictableTransactionResult<(), BlockchainError> {
                let tip = blocks
                    .get(StoreKey::Tip.as_bytes())?
                    .map(|tip| tip.to_vec())
                    .unwrap_or_default();
                if tip.as_slice() != block.get_pre_block_hash() {
                    return abort(BlockchainError::StaleTip(format!(
                        "Block {} builds on {}, tip is {}",
                        block.get_hash_hex(),
                        HEXLOWER.encode(block.get_pre_block_hash()),
                        HEXLOWER.encode(&tip)
                    )));
                }

                blocks.insert(StoreKey::Block(block_hash).as_bytes(), block_data.as_slice())?;
                blocks.insert(StoreKey::Tip.as_bytes(), block_hash)?;
                apply_block(chainstate, block)?;
                Ok(())
            },
        )?;

        self.db.flush()?;
        Ok(())
    }

    /// Unspent outputs found by walking the chain from tip to genesis,
    /// ( K -> txid, V -> Vec<UnspentOutput> ).
    pub fn find_utxo(&self) -> Result<HashMap<Vec<u8>, Vec<UnspentOutput>>> {
        let mut utxo: HashMap<Vec<u8>, Vec<UnspentOutput>> = HashMap::new();
        let mut spent_txos: HashMap<Vec<u8>, HashSet<usize>> = HashMap::new();

        for block in self.iterator()? {
            // newest first, so spends are seen before the outputs they consume
            for tx in block.get_transactions().iter().rev() {
                let spent = spent_txos.get(tx.get_id());
                let unspent: Vec<UnspentOutput> = tx
                    .get_vout()
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !spent.is_some_and(|spent| spent.contains(idx)))
                    .map(|(vout, output)| UnspentOutput {
                        vout,
                        output: output.clone(),
                    })
                    .collect();
                if !unspent.is_empty() {
                    utxo.insert(tx.get_id().to_vec(), unspent);
                }

                for out_point in tx.spent_outpoints()? {
                    spent_txos
                        .entry(out_point.txid)
                        .or_default()
                        .insert(out_point.vout);
                }
            }
        }
        Ok(utxo)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        for block in self.iterator()? {
            if let Some(tx) = block
                .get_transactions()
                .iter()
                .find(|tx| tx.get_id() == txid)
            {
                return Ok(Some(tx.clone()));
            }
        }
        Ok(None)
    }

    /// Admission check for a loose transaction: every input must reference an
    /// unspent output, carry a valid signature by its owner, and not create
    /// value.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool> {
        if tx.is_coinbase() {
            return Ok(false);
        }
        let prev_outputs = UTXOSet::new(self.clone()).prev_outputs(tx)?;
        Ok(tx.verify(&prev_outputs)? && tx.verify_balance(&prev_outputs)?)
    }
}

/// Walks from the tip back to genesis, one block per step.
pub struct BlockchainIterator {
    blocks: Tree,
    current_hash: Vec<u8>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, blocks: Tree) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: tip_hash,
            blocks,
        }
    }
}

impl Iterator for BlockchainIterator {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        if self.current_hash.is_empty() {
            return None;
        }

        let bytes = match self.blocks.get(StoreKey::Block(&self.current_hash).as_bytes()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                warn!(
                    "Chain integrity: block {} is missing, stopping iteration",
                    HEXLOWER.encode(&self.current_hash)
                );
                self.current_hash.clear();
                return None;
            }
            Err(e) => {
                error!("Failed to read block: {e}");
                self.current_hash.clear();
                return None;
            }
        };

        match Block::deserialize(bytes.as_ref()) {
            Ok(block) => {
                self.current_hash = block.get_pre_block_hash().to_vec();
                Some(block)
            }
            Err(e) => {
                warn!(
                    "Chain integrity: block {} is unreadable ({e}), stopping iteration",
                    HEXLOWER.encode(&self.current_hash)
                );
                self.current_hash.clear();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TXOutput;
    use crate::testnet::test_utils::{TestChain, TEST_DIFFICULTY};
    use crate::wallet::Wallet;
    use tempfile::TempDir;

    #[test]
    fn test_create_blockchain_mines_genesis() {
        let chain = TestChain::new();
        let genesis = chain.blockchain.iterator().unwrap().next().unwrap();

        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_transactions().len(), 1);
        assert!(genesis.get_transactions()[0].is_coinbase());
        assert_eq!(chain.blockchain.get_best_height().unwrap(), 1);
        assert!(genesis.validate_structure(TEST_DIFFICULTY).is_ok());
    }

    #[test]
    fn test_open_empty_store() {
        let dir = TempDir::new().unwrap();
        let blockchain = Blockchain::open(dir.path(), TEST_DIFFICULTY).unwrap();

        assert!(blockchain.is_empty().unwrap());
        assert_eq!(blockchain.get_best_height().unwrap(), 0);
        assert!(blockchain.get_block_hashes().unwrap().is_empty());
    }

    #[test]
    fn test_block_hashes_run_genesis_first() {
        let chain = TestChain::new();
        let second = chain.mine_with(vec![]);
        let third = chain.mine_with(vec![]);

        let hashes = chain.blockchain.get_block_hashes().unwrap();
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[1], second.get_hash());
        assert_eq!(hashes[2], third.get_hash());
        assert_eq!(chain.blockchain.get_tip_hash().unwrap(), third.get_hash());
    }

    #[test]
    fn test_mine_rejects_double_spend_in_block() {
        let chain = TestChain::new();
        let tx = chain.pay(&Wallet::new().unwrap().get_address(), 10);
        let coinbase = Transaction::new_coinbase_tx(&chain.miner.get_address(), "").unwrap();

        let result = chain.blockchain.mine_block(&[coinbase, tx.clone(), tx]);
        assert!(matches!(result, Err(BlockchainError::InvalidBlock(_))));
        assert_eq!(chain.blockchain.get_best_height().unwrap(), 1);
    }

    #[test]
    fn test_accept_block_outcomes() {
        let source = TestChain::new();
        let block = source.mine_with(vec![]);

        let dir = TempDir::new().unwrap();
        let fresh = Blockchain::open(dir.path(), TEST_DIFFICULTY).unwrap();

        // the second block does not extend an empty ledger
        assert_eq!(
            fresh.accept_block(&block).unwrap(),
            AcceptOutcome::NotExtendingTip
        );

        let genesis = source
            .blockchain
            .get_block(block.get_pre_block_hash())
            .unwrap()
            .unwrap();
        assert_eq!(fresh.accept_block(&genesis).unwrap(), AcceptOutcome::Committed);
        assert_eq!(fresh.accept_block(&genesis).unwrap(), AcceptOutcome::AlreadyKnown);
        assert_eq!(fresh.accept_block(&block).unwrap(), AcceptOutcome::Committed);
        assert_eq!(fresh.get_tip_hash().unwrap(), block.get_hash());
    }

    #[test]
    fn test_accept_block_rejects_inflated_coinbase() {
        let chain = TestChain::new();
        let tip = chain.blockchain.get_tip_hash().unwrap();
        let pkh = Wallet::new().unwrap().get_pub_key_hash();

        let inflated =
            Transaction::coinbase_for_test(vec![TXOutput::new_locked(1_000_000, pkh)]).unwrap();
        let mut block = Block::new_block(tip.clone(), &[inflated]).unwrap();
        block.mine(TEST_DIFFICULTY).unwrap();

        assert!(matches!(
            chain.blockchain.accept_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(chain.blockchain.get_tip_hash().unwrap(), tip);
        assert!(!chain.blockchain.has_block(block.get_hash()).unwrap());
    }

    #[test]
    fn test_find_transaction() {
        let chain = TestChain::new();
        let tx = chain.pay(&Wallet::new().unwrap().get_address(), 5);
        chain.mine_with(vec![tx.clone()]);

        let found = chain.blockchain.find_transaction(tx.get_id()).unwrap();
        assert_eq!(found, Some(tx));
        assert!(chain.blockchain.find_transaction(&[0u8; 32]).unwrap().is_none());
    }

    #[test]
    fn test_iterator_stops_at_missing_block() {
        let dir = TempDir::new().unwrap();
        let blockchain = Blockchain::open(dir.path(), TEST_DIFFICULTY).unwrap();
        let mut iter = BlockchainIterator::new(vec![7u8; 32], blockchain.blocks.clone());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }
}
