use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::BigUint;

/// Leading zero bits a block hash needs. Fixed, there is no retargeting.
pub const DEFAULT_DIFFICULTY: u32 = 12;

pub const MAX_NONCE: i64 = i64::MAX;

const PROGRESS_INTERVAL: i64 = 100_000;

pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: BigUint,
    tx_hash: Vec<u8>,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block, difficulty: u32) -> ProofOfWork<'a> {
        ProofOfWork {
            block,
            target: Self::target(difficulty),
            tx_hash: block.hash_transactions(),
        }
    }

    /// `2^(256 - difficulty)`
    pub fn target(difficulty: u32) -> BigUint {
        BigUint::from(1u8) << 256u32.saturating_sub(difficulty)
    }

    /// Recomputes the hash from the block's recorded fields and nonce. The
    /// block is valid when that hash matches the recorded one and sits below
    /// the target.
    pub fn validate(block: &Block, difficulty: u32) -> bool {
        let pow = ProofOfWork::new_proof_of_work(block, difficulty);
        let hash = sha256_digest(&pow.prepare_data(block.get_nonce()));
        hash.as_slice() == block.get_hash() && pow.meets_target(&hash)
    }

    fn meets_target(&self, hash: &[u8]) -> bool {
        BigUint::from_bytes_be(hash) < self.target
    }

    // prev_hash || flat tx hash || LE64(timestamp) || LE64(nonce)
    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let mut data_bytes = Vec::with_capacity(self.block.get_pre_block_hash().len() + 48);
        data_bytes.extend(self.block.get_pre_block_hash());
        data_bytes.extend(&self.tx_hash);
        data_bytes.extend(self.block.get_timestamp().to_le_bytes());
        data_bytes.extend(nonce.to_le_bytes());
        data_bytes
    }

    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        let mut nonce = 0;
        debug!("Mining with target {:x}", self.target);
        while nonce < MAX_NONCE {
            let hash = sha256_digest(&self.prepare_data(nonce));
            if self.meets_target(&hash) {
                info!("Found hash {} at nonce {nonce}", HEXLOWER.encode(&hash));
                return Ok((nonce, hash));
            }
            if nonce % PROGRESS_INTERVAL == 0 && nonce > 0 {
                debug!("Still mining, nonce {nonce}");
            }
            nonce += 1;
        }
        Err(BlockchainError::Mining(
            "Nonce space exhausted without meeting the target".to_string(),
        ))
    }
}
