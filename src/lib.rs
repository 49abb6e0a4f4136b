//! # utxo-chain
//!
//! A minimal proof-of-work ledger with a UTXO transaction model and a small
//! gossip protocol between nodes.
//!
//! ## Layout
//! - `core/`: blocks, proof-of-work, transactions, the sled-backed ledger
//! - `storage/`: typed keys, the unspent-output index, the memory pool
//! - `network/`: framing, messages, peer table, connections, the node server
//! - `wallet/`: ECDSA P-256 key pairs and hex addresses
//! - `config/`: node settings
//! - `utils/`: hashing, signing and bincode helpers
//! - `cli/`: command-line parsing
//!
//! ## Known limitations
//! - No fork choice: a block is accepted only if it extends the current tip.
//! - Difficulty is a fixed setting with no retargeting.
//! - The block's transaction commitment is a flat hash, not a Merkle root.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

pub use cli::{Command, Opt};
pub use config::NodeConfig;
pub use core::{
    AcceptOutcome, Block, Blockchain, BlockchainIterator, OutPoint, ProofOfWork, TXInput,
    TXOutput, Transaction, DEFAULT_DIFFICULTY, SUBSIDY,
};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Message, PeerRegistry, Server};
pub use storage::{MemoryPool, UTXOSet};
pub use utils::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN,
};
