//! UTXO-set maintenance over the store. Values keep their original
//! output indices as sparse `(index, output)` pairs, so an input's
//! `vout` still selects the right output after partial spends.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use secp256k1::SecretKey;

use minibit_primitives::{
    address_from_pubkey_hash, hash160, Block, DecodeError, Decoder, Encoder, Hash256, Transaction,
    TxError, TxInput, TxOutput,
};
use minibit_storage::{Column, KeyValueStore, WriteBatch};

use crate::chain::{Chain, ChainError};

pub fn encode_outputs(outputs: &[(u32, TxOutput)]) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_varint(outputs.len() as u64);
    for (index, output) in outputs {
        encoder.write_u32_le(*index);
        output.encode_into(&mut encoder);
    }
    encoder.into_inner()
}

pub fn decode_outputs(bytes: &[u8]) -> Result<Vec<(u32, TxOutput)>, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let count = decoder.read_varint()?;
    let mut outputs = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let index = decoder.read_u32_le()?;
        let output = TxOutput::decode_from(&mut decoder)?;
        outputs.push((index, output));
    }
    decoder.finish()?;
    Ok(outputs)
}

/// Stages the UTXO deltas of `block` onto `batch`: spent entries are
/// removed by original index (key deleted once empty) and each
/// transaction's outputs become the fresh list under its own id. Reads
/// go through an overlay so transactions later in the block observe
/// earlier staged changes.
pub(crate) fn stage_block_update<S: KeyValueStore>(
    store: &S,
    batch: &mut WriteBatch,
    block: &Block,
) -> Result<(), ChainError> {
    let mut overlay: HashMap<Hash256, Option<Vec<(u32, TxOutput)>>> = HashMap::new();

    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.vin {
                let txid = input
                    .txid
                    .ok_or(ChainError::InvalidTx(TxError::CoinbaseMalformed))?;
                let spent_index = u32::try_from(input.vout)
                    .map_err(|_| ChainError::InvalidTx(TxError::PrevTxMissing(txid)))?;

                let entry = match overlay.entry(txid) {
                    Entry::Occupied(slot) => slot.into_mut(),
                    Entry::Vacant(slot) => {
                        let loaded = match store.get(Column::Utxo, &txid)? {
                            Some(bytes) => Some(decode_outputs(&bytes)?),
                            None => None,
                        };
                        slot.insert(loaded)
                    }
                };
                let outputs = entry
                    .as_mut()
                    .ok_or(ChainError::InvalidTx(TxError::PrevTxMissing(txid)))?;
                let position = outputs
                    .iter()
                    .position(|(index, _)| *index == spent_index)
                    .ok_or(ChainError::InvalidTx(TxError::PrevTxMissing(txid)))?;
                outputs.remove(position);
                if outputs.is_empty() {
                    *entry = None;
                }
            }
        }

        let fresh: Vec<(u32, TxOutput)> = tx
            .vout
            .iter()
            .enumerate()
            .map(|(index, output)| (index as u32, output.clone()))
            .collect();
        overlay.insert(tx.id, Some(fresh));
    }

    for (txid, entry) in overlay {
        match entry {
            Some(outputs) => batch.put(Column::Utxo, txid.to_vec(), encode_outputs(&outputs)),
            None => batch.delete(Column::Utxo, txid.to_vec()),
        }
    }
    Ok(())
}

/// Queries and bulk maintenance over the UTXO column.
pub struct UtxoSet<'a, S> {
    chain: &'a Chain<S>,
}

impl<'a, S: KeyValueStore> UtxoSet<'a, S> {
    pub fn new(chain: &'a Chain<S>) -> Self {
        Self { chain }
    }

    /// Sum of all unspent output values locked to `pubkey_hash`.
    pub fn balance(&self, pubkey_hash: &[u8]) -> Result<i64, ChainError> {
        let mut balance = 0i64;
        for (_, bytes) in self.chain.store().scan(Column::Utxo)? {
            for (_, output) in decode_outputs(&bytes)? {
                if output.is_locked_with(pubkey_hash) {
                    balance += output.value;
                }
            }
        }
        Ok(balance)
    }

    /// Whether `(txid, vout)` is currently unspent.
    pub fn has_output(&self, txid: &Hash256, vout: i64) -> Result<bool, ChainError> {
        let Ok(vout) = u32::try_from(vout) else {
            return Ok(false);
        };
        match self.chain.store().get(Column::Utxo, txid)? {
            Some(bytes) => Ok(decode_outputs(&bytes)?
                .iter()
                .any(|(index, _)| *index == vout)),
            None => Ok(false),
        }
    }

    /// Accumulates outputs locked to `pubkey_hash` until `amount` is
    /// covered. Returns what was found even when underfunded so the
    /// caller can report the shortfall.
    pub fn find_spendable(
        &self,
        pubkey_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, HashMap<Hash256, Vec<u32>>), ChainError> {
        let mut accumulated = 0i64;
        let mut spendable: HashMap<Hash256, Vec<u32>> = HashMap::new();

        'scan: for (key, bytes) in self.chain.store().scan(Column::Utxo)? {
            if key.len() != 32 {
                continue;
            }
            let mut txid = [0u8; 32];
            txid.copy_from_slice(&key);
            for (index, output) in decode_outputs(&bytes)? {
                if !output.is_locked_with(pubkey_hash) {
                    continue;
                }
                accumulated += output.value;
                spendable.entry(txid).or_default().push(index);
                if accumulated >= amount {
                    break 'scan;
                }
            }
        }
        Ok((accumulated, spendable))
    }

    /// Builds and signs a transfer spending the wallet's confirmed
    /// outputs, returning change to the sender.
    pub fn build_transfer(
        &self,
        secret_key: &SecretKey,
        pubkey: &[u8],
        to: &str,
        amount: i64,
    ) -> Result<Transaction, ChainError> {
        let pubkey_hash = hash160(pubkey);
        let (available, spendable) = self.find_spendable(&pubkey_hash, amount)?;
        if available < amount {
            return Err(ChainError::InsufficientFunds {
                available,
                required: amount,
            });
        }

        let mut vin = Vec::new();
        for (txid, indices) in spendable {
            for index in indices {
                vin.push(TxInput {
                    txid: Some(txid),
                    vout: i64::from(index),
                    signature: Vec::new(),
                    pubkey: pubkey.to_vec(),
                });
            }
        }

        let mut vout = vec![TxOutput::locked_to(amount, to)?];
        if available > amount {
            let change_address = address_from_pubkey_hash(&pubkey_hash);
            vout.push(TxOutput::locked_to(available - amount, &change_address)?);
        }

        let mut tx = Transaction {
            id: [0u8; 32],
            vin,
            vout,
        };
        tx.set_id();

        let prev_txs = self.chain.referenced_txs(&tx)?;
        tx.sign(secret_key, &prev_txs)
            .map_err(ChainError::InvalidTx)?;
        Ok(tx)
    }

    /// Drops the UTXO column and rebuilds it from a full chain scan,
    /// in one batch. Used after bulk sync and by the operator command.
    pub fn reindex(&self) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        for (key, _) in self.chain.store().scan(Column::Utxo)? {
            batch.delete(Column::Utxo, key);
        }
        for (txid, outputs) in self.chain.find_all_utxo()? {
            batch.put(Column::Utxo, txid.to_vec(), encode_outputs(&outputs));
        }
        self.chain.store().write_batch(&batch)?;
        Ok(())
    }
}
