//! Utility functions and helpers
//!
//! Hashing, ECDSA signing and the bincode helpers shared by storage
//! and transaction hashing.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    current_timestamp, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, ripemd160_digest, sha256_digest,
};

pub use serialization::{deserialize, serialize};
