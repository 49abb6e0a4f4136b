//! Key pairs and addresses
//!
//! A wallet here is just an ECDSA P-256 key pair; addresses are the hex
//! form of version byte, public key hash and checksum.

#[allow(clippy::module_inception)]
pub mod wallet;

pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet,
    ADDRESS_CHECK_SUM_LEN, PUB_KEY_HASH_LEN,
};
