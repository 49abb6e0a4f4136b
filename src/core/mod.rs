//! Core blockchain functionality
//!
//! Blocks, transactions, the sled-backed ledger and proof-of-work.

pub mod block;
pub mod blockchain;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{AcceptOutcome, Blockchain, BlockchainIterator};
pub use proof_of_work::{ProofOfWork, DEFAULT_DIFFICULTY, MAX_NONCE};
pub use transaction::{OutPoint, PrevOutputs, TXInput, TXOutput, Transaction, SUBSIDY};
