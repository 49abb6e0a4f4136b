//! Typed keys for the sled trees
//!
//! Every reader and writer goes through `StoreKey` so a key is always
//! derived the same way for the tree it belongs to.

/// Blocks by hash, plus the tip pointer.
pub const BLOCKS_TREE: &str = "blocks";
/// Unspent outputs by transaction id.
pub const CHAINSTATE_TREE: &str = "chainstate";

const TIP_KEY: &[u8] = b"l";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey<'a> {
    Block(&'a [u8]),
    Tip,
    Utxo(&'a [u8]),
}

impl<'a> StoreKey<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        match self {
            StoreKey::Block(hash) => *hash,
            StoreKey::Tip => TIP_KEY,
            StoreKey::Utxo(txid) => *txid,
        }
    }
}

impl AsRef<[u8]> for StoreKey<'_> {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
