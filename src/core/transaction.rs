// UTXO transactions: each one consumes previous outputs and creates new ones.
// Inputs are signed one at a time over a trimmed copy of the transaction so a
// signature only ever covers the output it unlocks.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{address_to_pub_key_hash, hash_pub_key, Wallet};
use data_encoding::HEXLOWER;
use log::debug;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed block reward paid by every coinbase transaction
pub const SUBSIDY: u64 = 50;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_VOUT: i64 = -1;

const COINBASE_MEMO_RANDOM_LEN: usize = 20;

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,      // id of the transaction holding the spent output
    vout: i64,          // index of that output, -1 for coinbase
    signature: Vec<u8>, // ECDSA signature over the per-input digest
    pub_key: Vec<u8>,   // spender's full public key, or the memo for coinbase
}

impl TXInput {
    pub fn new(txid: &[u8], vout: usize) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout: vout as i64,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output index, `None` for the coinbase marker.
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }

    fn out_point(&self) -> Result<OutPoint> {
        let vout = self.output_index().ok_or_else(|| {
            BlockchainError::Transaction(format!(
                "Input spending {} has negative output index {}",
                HEXLOWER.encode(&self.txid),
                self.vout
            ))
        })?;
        Ok(OutPoint::new(&self.txid, vout))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>, // locking hash of the key allowed to spend this output
}

impl TXOutput {
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        let pub_key_hash = address_to_pub_key_hash(address)?;
        Ok(TXOutput::new_locked(value, pub_key_hash))
    }

    pub fn new_locked(value: u64, pub_key_hash: Vec<u8>) -> TXOutput {
        TXOutput {
            value,
            pub_key_hash,
        }
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

/// Reference to one output of a previous transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: Vec<u8>,
    pub vout: usize,
}

impl OutPoint {
    pub fn new(txid: &[u8], vout: usize) -> OutPoint {
        OutPoint {
            txid: txid.to_vec(),
            vout,
        }
    }
}

/// Previous outputs a transaction's inputs refer to, supplied by the caller.
pub type PrevOutputs = HashMap<OutPoint, TXOutput>;

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Reward transaction: one marker input carrying `memo`, one output paying
    /// the subsidy. An empty memo is replaced with random bytes so repeated
    /// rewards to the same address still get distinct ids.
    pub fn new_coinbase_tx(to: &str, memo: &str) -> Result<Transaction> {
        let txout = TXOutput::new(SUBSIDY, to)?;

        let memo = if memo.is_empty() {
            let mut random = [0u8; COINBASE_MEMO_RANDOM_LEN];
            rand::thread_rng().fill_bytes(&mut random);
            HEXLOWER.encode(&random)
        } else {
            memo.to_string()
        };

        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_VOUT,
            signature: vec![],
            pub_key: memo.into_bytes(),
        };

        let mut tx = Transaction {
            id: vec![],
            vin: vec![tx_input],
            vout: vec![txout],
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Pays `amount` to `to` out of the wallet's unspent outputs, returning
    /// change to the wallet. The result is signed and carries its final id.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }

        let to_pub_key_hash = address_to_pub_key_hash(to)?;
        let public_key_hash = wallet.get_pub_key_hash();

        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(public_key_hash.as_slice(), amount)?;

        let mut selected: Vec<(&String, &Vec<usize>)> = valid_outputs.iter().collect();
        selected.sort();

        let mut inputs = vec![];
        for (txid_hex, outs) in selected {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Transaction(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                inputs.push(TXInput {
                    txid: txid.clone(),
                    vout: *out as i64,
                    signature: vec![],
                    pub_key: wallet.get_public_key().to_vec(),
                });
            }
        }

        let mut outputs = vec![TXOutput::new_locked(amount, to_pub_key_hash)];
        if accumulated > amount {
            outputs.push(TXOutput::new_locked(
                accumulated - amount,
                public_key_hash.clone(),
            ));
        }

        let mut tx = Transaction {
            id: vec![],
            vin: inputs,
            vout: outputs,
        };
        tx.id = tx.hash()?;

        let prev_outputs = utxo_set.prev_outputs(&tx)?;
        tx.sign(wallet.get_pkcs8(), &prev_outputs)?;
        tx.id = tx.hash()?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_empty() && self.vin[0].vout == COINBASE_VOUT
    }

    /// Content hash over everything except the id field itself.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(&tx_copy.serialize()?))
    }

    fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .vin
            .iter()
            .map(|input| TXInput {
                txid: input.txid.clone(),
                vout: input.vout,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin: inputs,
            vout: self.vout.clone(),
        }
    }

    fn referenced_output<'a>(
        &self,
        idx: usize,
        prev_outputs: &'a PrevOutputs,
    ) -> Result<&'a TXOutput> {
        let out_point = self.vin[idx].out_point()?;
        prev_outputs.get(&out_point).ok_or_else(|| {
            BlockchainError::Integrity(format!(
                "Previous output {}:{} is not in the lookup",
                HEXLOWER.encode(&out_point.txid),
                out_point.vout
            ))
        })
    }

    /// Digest signed by input `idx`: the trimmed copy with only that input's
    /// pub_key slot holding the referenced output's locking hash.
    fn signature_digest(
        &self,
        tx_copy: &mut Transaction,
        idx: usize,
        prev_outputs: &PrevOutputs,
    ) -> Result<Vec<u8>> {
        let prev_output = self.referenced_output(idx, prev_outputs)?;
        tx_copy.vin[idx].signature = vec![];
        tx_copy.vin[idx].pub_key = prev_output.pub_key_hash.clone();
        let digest = tx_copy.hash();
        tx_copy.vin[idx].pub_key = vec![];
        digest
    }

    pub fn sign(&mut self, pkcs8: &[u8], prev_outputs: &PrevOutputs) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }
        for idx in 0..self.vin.len() {
            self.sign_input(idx, pkcs8, prev_outputs)?;
        }
        Ok(())
    }

    /// Signs a single input, leaving every other input untouched.
    pub fn sign_input(&mut self, idx: usize, pkcs8: &[u8], prev_outputs: &PrevOutputs) -> Result<()> {
        if idx >= self.vin.len() {
            return Err(BlockchainError::Transaction(format!(
                "Input index {idx} out of range"
            )));
        }
        let mut tx_copy = self.trimmed_copy();
        let digest = self.signature_digest(&mut tx_copy, idx, prev_outputs)?;
        self.vin[idx].signature = ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?;
        Ok(())
    }

    /// `Ok(false)` on a bad signature or a key that does not own the output;
    /// `Err` when the lookup is missing a referenced output.
    pub fn verify(&self, prev_outputs: &PrevOutputs) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        if self.vin.is_empty() {
            return Ok(false);
        }

        let mut tx_copy = self.trimmed_copy();
        for idx in 0..self.vin.len() {
            if !self.verify_input_with(&mut tx_copy, idx, prev_outputs)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn verify_input(&self, idx: usize, prev_outputs: &PrevOutputs) -> Result<bool> {
        if idx >= self.vin.len() {
            return Err(BlockchainError::Transaction(format!(
                "Input index {idx} out of range"
            )));
        }
        let mut tx_copy = self.trimmed_copy();
        self.verify_input_with(&mut tx_copy, idx, prev_outputs)
    }

    fn verify_input_with(
        &self,
        tx_copy: &mut Transaction,
        idx: usize,
        prev_outputs: &PrevOutputs,
    ) -> Result<bool> {
        let vin = &self.vin[idx];
        let prev_output = self.referenced_output(idx, prev_outputs)?;
        if !vin.uses_key(prev_output.get_pub_key_hash()) {
            debug!(
                "Input {idx} of {} is signed by a key that does not own the output",
                HEXLOWER.encode(&self.id)
            );
            return Ok(false);
        }

        let digest = self.signature_digest(tx_copy, idx, prev_outputs)?;
        Ok(ecdsa_p256_sha256_sign_verify(
            vin.pub_key.as_slice(),
            vin.signature.as_slice(),
            &digest,
        ))
    }

    /// Sum of the outputs this transaction spends.
    pub fn input_value(&self, prev_outputs: &PrevOutputs) -> Result<u64> {
        if self.is_coinbase() {
            return Ok(0);
        }
        let mut total = 0u64;
        for idx in 0..self.vin.len() {
            let prev_output = self.referenced_output(idx, prev_outputs)?;
            total = total
                .checked_add(prev_output.get_value())
                .ok_or_else(|| BlockchainError::Transaction("Input value overflow".to_string()))?;
        }
        Ok(total)
    }

    pub fn output_value(&self) -> Result<u64> {
        let mut total = 0u64;
        for vout in &self.vout {
            total = total
                .checked_add(vout.get_value())
                .ok_or_else(|| BlockchainError::Transaction("Output value overflow".to_string()))?;
        }
        Ok(total)
    }

    /// Outputs may not create more value than the inputs release.
    pub fn verify_balance(&self, prev_outputs: &PrevOutputs) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }
        Ok(self.output_value()? <= self.input_value(prev_outputs)?)
    }

    /// Every outpoint this transaction spends, empty for coinbase.
    pub fn spent_outpoints(&self) -> Result<Vec<OutPoint>> {
        if self.is_coinbase() {
            return Ok(vec![]);
        }
        self.vin.iter().map(TXInput::out_point).collect()
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_id_hex(&self) -> String {
        HEXLOWER.encode(&self.id)
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }
}

#[cfg(test)]
impl Transaction {
    /// A signed spend of `spent` with arbitrary outputs, including none.
    pub(crate) fn signed_spend_for_test(
        wallet: &Wallet,
        spent: &[OutPoint],
        vout: Vec<TXOutput>,
        prev_outputs: &PrevOutputs,
    ) -> Result<Transaction> {
        let vin = spent
            .iter()
            .map(|out_point| TXInput {
                txid: out_point.txid.clone(),
                vout: out_point.vout as i64,
                signature: vec![],
                pub_key: wallet.get_public_key().to_vec(),
            })
            .collect();
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        tx.sign(wallet.get_pkcs8(), prev_outputs)?;
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// A coinbase paying whatever `vout` says.
    pub(crate) fn coinbase_for_test(vout: Vec<TXOutput>) -> Result<Transaction> {
        let mut tx = Transaction {
            id: vec![],
            vin: vec![TXInput {
                txid: vec![],
                vout: COINBASE_VOUT,
                signature: vec![],
                pub_key: b"test".to_vec(),
            }],
            vout,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }
}
