use crate::core::{Block, Blockchain, OutPoint, PrevOutputs, TXOutput, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::StoreKey;
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use sled::transaction::{abort, ConflictableTransactionResult, TransactionalTree};
use std::collections::{BTreeMap, HashMap};

/// An output that has not been spent yet, remembered with its original
/// index so spending a sibling never renumbers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UnspentOutput {
    pub vout: usize,
    pub output: TXOutput,
}

/// Derived view of the ledger, ( K -> txid, V -> Vec<UnspentOutput> ).
///
/// Rebuildable at any time with `reindex`; the ledger stays the source of
/// truth.
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    /// Accumulates outputs locked by `pub_key_hash` until `amount` is
    /// covered. Fails with `InsufficientFunds` when the index runs out first.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<String, Vec<usize>>)> {
        let mut unspent_outputs: HashMap<String, Vec<usize>> = HashMap::new();
        let mut accumulated = 0u64;

        for item in self.blockchain.get_chainstate().iter() {
            if accumulated >= amount {
                break;
            }
            let (k, v) = item?;
            let txid_hex = HEXLOWER.encode(k.as_ref());
            let outs: Vec<UnspentOutput> = deserialize(v.as_ref())?;

            for unspent in outs {
                if accumulated >= amount {
                    break;
                }
                if unspent.output.is_locked_with_key(pub_key_hash) {
                    accumulated = accumulated.saturating_add(unspent.output.get_value());
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(unspent.vout);
                }
            }
        }

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for item in self.blockchain.get_chainstate().iter() {
            let (_, v) = item?;
            let outs: Vec<UnspentOutput> = deserialize(v.as_ref())?;
            utxos.extend(
                outs.into_iter()
                    .map(|unspent| unspent.output)
                    .filter(|out| out.is_locked_with_key(pub_key_hash)),
            );
        }
        Ok(utxos)
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        Ok(self
            .find_utxo(pub_key_hash)?
            .iter()
            .map(TXOutput::get_value)
            .sum())
    }

    /// `None` when the output was spent or never existed.
    pub fn find_output(&self, out_point: &OutPoint) -> Result<Option<TXOutput>> {
        let key = StoreKey::Utxo(&out_point.txid);
        let Some(bytes) = self.blockchain.get_chainstate().get(key.as_bytes())? else {
            return Ok(None);
        };
        let outs: Vec<UnspentOutput> = deserialize(bytes.as_ref())?;
        Ok(outs
            .into_iter()
            .find(|unspent| unspent.vout == out_point.vout)
            .map(|unspent| unspent.output))
    }

    /// Previous outputs for every input of `tx`, read from the index. An
    /// input whose output is no longer unspent rejects the transaction.
    pub fn prev_outputs(&self, tx: &Transaction) -> Result<PrevOutputs> {
        let mut prev_outputs = PrevOutputs::new();
        for out_point in tx.spent_outpoints()? {
            let output = self.find_output(&out_point)?.ok_or_else(|| {
                BlockchainError::Transaction(format!(
                    "Output {}:{} is not unspent",
                    HEXLOWER.encode(&out_point.txid),
                    out_point.vout
                ))
            })?;
            prev_outputs.insert(out_point, output);
        }
        Ok(prev_outputs)
    }

    pub fn count_transactions(&self) -> Result<u64> {
        let mut counter = 0;
        for item in self.blockchain.get_chainstate().iter() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Ordered copy of the whole index.
    pub fn snapshot(&self) -> Result<BTreeMap<Vec<u8>, Vec<UnspentOutput>>> {
        let mut snapshot = BTreeMap::new();
        for item in self.blockchain.get_chainstate().iter() {
            let (k, v) = item?;
            snapshot.insert(k.to_vec(), deserialize(v.as_ref())?);
        }
        Ok(snapshot)
    }

    /// Rebuilds the index from the ledger, replacing the old contents in one
    /// storage transaction.
    pub fn reindex(&self) -> Result<()> {
        let utxo_map = self.blockchain.find_utxo()?;
        let mut encoded = Vec::with_capacity(utxo_map.len());
        for (txid, outs) in &utxo_map {
            encoded.push((txid.as_slice(), serialize(outs)?));
        }

        let chainstate = self.blockchain.get_chainstate();
        let mut stale_keys = vec![];
        for key in chainstate.iter().keys() {
            stale_keys.push(key?);
        }

        chainstate.transaction(|tree| -> ConflictableTransactionResult<(), BlockchainError> {
            for key in &stale_keys {
                tree.remove(&key[..])?;
            }
            for (txid, outs) in &encoded {
                tree.insert(StoreKey::Utxo(txid).as_bytes(), outs.as_slice())?;
            }
            Ok(())
        })?;

        info!("Reindexed UTXO set: {} transactions", encoded.len());
        Ok(())
    }

    /// Applies one block that is already committed to the ledger. The ledger
    /// commit path applies blocks itself inside its transaction; this exists
    /// for rebuilding an index block by block.
    pub fn update(&self, block: &Block) -> Result<()> {
        self.blockchain
            .get_chainstate()
            .transaction(|tree| apply_block(tree, block))?;
        Ok(())
    }
}

/// Spends every input of the block and adds every transaction's outputs.
/// Only transactions with at least one output get an entry, matching what
/// `Blockchain::find_utxo` rebuilds.
/// Aborts with `Integrity` when an input refers to an output the index does
/// not hold.
pub fn apply_block(
    tree: &TransactionalTree,
    block: &Block,
) -> ConflictableTransactionResult<(), BlockchainError> {
    for tx in block.get_transactions() {
        if !tx.is_coinbase() {
            for vin in tx.get_vin() {
                let Some(vout) = vin.output_index() else {
                    return abort(BlockchainError::Transaction(format!(
                        "Transaction {} has a negative output index",
                        tx.get_id_hex()
                    )));
                };
                let key = StoreKey::Utxo(vin.get_txid());
                let Some(outs_bytes) = tree.get(key.as_bytes())? else {
                    return abort(BlockchainError::Integrity(format!(
                        "UTXO entry {} missing while applying block {}",
                        HEXLOWER.encode(vin.get_txid()),
                        block.get_hash_hex()
                    )));
                };
                let mut outs: Vec<UnspentOutput> = match deserialize(outs_bytes.as_ref()) {
                    Ok(outs) => outs,
                    Err(e) => return abort(e),
                };

                let before = outs.len();
                outs.retain(|unspent| unspent.vout != vout);
                if outs.len() == before {
                    return abort(BlockchainError::Integrity(format!(
                        "Output {}:{vout} already spent",
                        HEXLOWER.encode(vin.get_txid())
                    )));
                }

                if outs.is_empty() {
                    tree.remove(key.as_bytes())?;
                } else {
                    let bytes = match serialize(&outs) {
                        Ok(bytes) => bytes,
                        Err(e) => return abort(e),
                    };
                    tree.insert(key.as_bytes(), bytes)?;
                }
            }
        }

        let new_outputs: Vec<UnspentOutput> = tx
            .get_vout()
            .iter()
            .enumerate()
            .map(|(vout, output)| UnspentOutput {
                vout,
                output: output.clone(),
            })
            .collect();
        // a transaction without outputs leaves nothing to index
        if new_outputs.is_empty() {
            continue;
        }
        let bytes = match serialize(&new_outputs) {
            Ok(bytes) => bytes,
            Err(e) => return abort(e),
        };
        tree.insert(StoreKey::Utxo(tx.get_id()).as_bytes(), bytes)?;
    }
    Ok(())
}
