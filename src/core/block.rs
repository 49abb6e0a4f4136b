use crate::core::{ProofOfWork, Transaction, SUBSIDY};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, deserialize, serialize, sha256_digest};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    timestamp: i64,
    transactions: Vec<Transaction>,
    pre_block_hash: Vec<u8>, // empty for genesis
    hash: Vec<u8>,
    nonce: i64,
}

impl Block {
    /// An unmined block: nonce zero and no hash until `mine` runs.
    pub fn new_block(pre_block_hash: Vec<u8>, transactions: &[Transaction]) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        Ok(Block {
            timestamp: current_timestamp()?,
            transactions: transactions.to_vec(),
            pre_block_hash,
            hash: vec![],
            nonce: 0,
        })
    }

    pub fn generate_genesis_block(coinbase: &Transaction, difficulty: u32) -> Result<Block> {
        let mut block = Block::new_block(vec![], &[coinbase.clone()])?;
        block.mine(difficulty)?;
        Ok(block)
    }

    /// Runs proof-of-work and records the winning nonce and hash.
    pub fn mine(&mut self, difficulty: u32) -> Result<()> {
        let (nonce, hash) = ProofOfWork::new_proof_of_work(self, difficulty).run()?;
        self.nonce = nonce;
        self.hash = hash;
        info!(
            "Mined block {} with {} transactions (difficulty {difficulty})",
            self.get_hash_hex(),
            self.transactions.len()
        );
        Ok(())
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash)
    }

    pub fn get_timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    /// A single SHA-256 over the concatenated transaction ids. This is a flat
    /// stand-in for a Merkle root: it commits to the ids but supports no
    /// inclusion proofs.
    pub fn hash_transactions(&self) -> Vec<u8> {
        let mut txhashs = vec![];
        for transaction in &self.transactions {
            txhashs.extend(transaction.get_id());
        }
        sha256_digest(txhashs.as_slice())
    }

    /// Everything `validate_transactions` checks, plus proof-of-work.
    pub fn validate_structure(&self, difficulty: u32) -> Result<()> {
        self.validate_transactions()?;
        if !ProofOfWork::validate(self, difficulty) {
            return Err(BlockchainError::InvalidBlock(format!(
                "Block {} fails proof-of-work",
                self.get_hash_hex()
            )));
        }
        Ok(())
    }

    /// Checks that need no chain state: exactly one coinbase, it comes first
    /// and pays exactly the subsidy in a single output. Ids must match
    /// content and no outpoint may be spent twice in the block.
    pub fn validate_transactions(&self) -> Result<()> {
        let (first, rest) = self.transactions.split_first().ok_or_else(|| {
            BlockchainError::InvalidBlock("Block has no transactions".to_string())
        })?;

        if !first.is_coinbase() {
            return Err(BlockchainError::InvalidBlock(
                "First transaction is not a coinbase".to_string(),
            ));
        }
        if rest.iter().any(Transaction::is_coinbase) {
            return Err(BlockchainError::InvalidBlock(
                "Block carries more than one coinbase".to_string(),
            ));
        }
        match first.get_vout() {
            [reward] if reward.get_value() == SUBSIDY => {}
            outputs => {
                return Err(BlockchainError::InvalidBlock(format!(
                    "Coinbase {} must pay {SUBSIDY} in one output, found {} outputs worth {}",
                    first.get_id_hex(),
                    outputs.len(),
                    first.output_value()?
                )))
            }
        }

        let mut spent = HashSet::new();
        for tx in &self.transactions {
            if tx.hash()? != tx.get_id() {
                return Err(BlockchainError::InvalidBlock(format!(
                    "Transaction {} id does not match its content",
                    tx.get_id_hex()
                )));
            }
            for out_point in tx.spent_outpoints()? {
                if !spent.insert(out_point.clone()) {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "Output {}:{} spent twice in one block",
                        HEXLOWER.encode(&out_point.txid),
                        out_point.vout
                    )));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_nonce_for_test(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }
}
