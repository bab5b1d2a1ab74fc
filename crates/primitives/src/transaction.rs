//! UTXO transactions: identity hashing, coinbase construction and
//! trimmed-copy ECDSA signing over secp256k1.

use std::collections::HashMap;
use std::fmt;

use rand::RngCore;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

use crate::address::{pubkey_hash_from_address, AddressError};
use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{hash_to_hex, sha256, Hash256};

/// Coinbase reward, fixed.
pub const SUBSIDY: i64 = 10;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TxError {
    PrevTxMissing(Hash256),
    SignatureInvalid,
    CoinbaseMalformed,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::PrevTxMissing(txid) => {
                write!(f, "referenced transaction {} not found", hash_to_hex(txid))
            }
            TxError::SignatureInvalid => write!(f, "input signature verification failed"),
            TxError::CoinbaseMalformed => write!(f, "malformed coinbase input"),
        }
    }
}

impl std::error::Error for TxError {}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOutput {
    pub value: i64,
    /// 20-byte HASH160 the output is locked to.
    pub pubkey_hash: Vec<u8>,
}

impl TxOutput {
    pub fn locked_to(value: i64, address: &str) -> Result<Self, AddressError> {
        let pubkey_hash = pubkey_hash_from_address(address)?;
        Ok(Self {
            value,
            pubkey_hash: pubkey_hash.to_vec(),
        })
    }

    pub fn is_locked_with(&self, pubkey_hash: &[u8]) -> bool {
        self.pubkey_hash == pubkey_hash
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.pubkey_hash);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let pubkey_hash = decoder.read_var_bytes()?;
        Ok(Self { value, pubkey_hash })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxInput {
    /// Referenced transaction, `None` for a coinbase input.
    pub txid: Option<Hash256>,
    /// Output index in the referenced transaction, `-1` for coinbase.
    pub vout: i64,
    /// DER-encoded ECDSA signature, empty until signed.
    pub signature: Vec<u8>,
    /// Compressed secp256k1 public key; a coinbase input carries the
    /// opaque data blob here instead.
    pub pubkey: Vec<u8>,
}

impl TxInput {
    fn encode_into(&self, encoder: &mut Encoder) {
        match &self.txid {
            Some(txid) => encoder.write_var_bytes(txid),
            None => encoder.write_var_bytes(&[]),
        }
        encoder.write_i64_le(self.vout);
        encoder.write_var_bytes(&self.signature);
        encoder.write_var_bytes(&self.pubkey);
    }

    fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let txid_bytes = decoder.read_var_bytes()?;
        let txid = match txid_bytes.len() {
            0 => None,
            32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&txid_bytes);
                Some(hash)
            }
            _ => return Err(DecodeError::InvalidHashLength),
        };
        let vout = decoder.read_i64_le()?;
        let signature = decoder.read_var_bytes()?;
        let pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            txid,
            vout,
            signature,
            pubkey,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub id: Hash256,
    pub vin: Vec<TxInput>,
    pub vout: Vec<TxOutput>,
}

impl Transaction {
    /// Builds a coinbase paying `subsidy` to `to`. When `data` is
    /// absent a fresh random blob is used so repeated coinbases to the
    /// same address still get distinct ids.
    pub fn coinbase(to: &str, data: Option<Vec<u8>>) -> Result<Self, AddressError> {
        let data = match data {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                let mut entropy = [0u8; 20];
                rand::thread_rng().fill_bytes(&mut entropy);
                entropy.to_vec()
            }
        };
        let input = TxInput {
            txid: None,
            vout: -1,
            signature: Vec::new(),
            pubkey: data,
        };
        let output = TxOutput::locked_to(SUBSIDY, to)?;
        let mut tx = Self {
            id: [0u8; 32],
            vin: vec![input],
            vout: vec![output],
        };
        tx.set_id();
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].txid.is_none() && self.vin[0].vout == -1
    }

    /// Canonical encoding without the id field, the txid preimage.
    fn encode_body(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_into(&mut encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn compute_id(&self) -> Hash256 {
        sha256(&self.encode_body())
    }

    pub fn set_id(&mut self) {
        self.id = self.compute_id();
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.id);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.encode_into(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.encode_into(encoder);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let id = decoder.read_fixed::<32>()?;
        let vin_count = decoder.read_varint()?;
        let mut vin = Vec::with_capacity(vin_count.min(1024) as usize);
        for _ in 0..vin_count {
            vin.push(TxInput::decode_from(decoder)?);
        }
        let vout_count = decoder.read_varint()?;
        let mut vout = Vec::with_capacity(vout_count.min(1024) as usize);
        for _ in 0..vout_count {
            vout.push(TxOutput::decode_from(decoder)?);
        }
        Ok(Self { id, vin, vout })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    /// Clone with every input's signature and pubkey cleared; the
    /// per-input signing preimage is derived from this.
    fn trimmed_copy(&self) -> Self {
        let vin = self
            .vin
            .iter()
            .map(|input| TxInput {
                txid: input.txid,
                vout: input.vout,
                signature: Vec::new(),
                pubkey: Vec::new(),
            })
            .collect();
        Self {
            id: self.id,
            vin,
            vout: self.vout.clone(),
        }
    }

    fn referenced_output<'a>(
        input: &TxInput,
        prev_txs: &'a HashMap<Hash256, Transaction>,
    ) -> Result<&'a TxOutput, TxError> {
        let txid = input.txid.ok_or(TxError::CoinbaseMalformed)?;
        let prev = prev_txs.get(&txid).ok_or(TxError::PrevTxMissing(txid))?;
        let index = usize::try_from(input.vout).map_err(|_| TxError::PrevTxMissing(txid))?;
        prev.vout.get(index).ok_or(TxError::PrevTxMissing(txid))
    }

    /// Signs every input against the output it spends. `prev_txs` must
    /// contain every referenced transaction, keyed by id.
    pub fn sign(
        &mut self,
        secret_key: &SecretKey,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<(), TxError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_secret_key(&secp, secret_key)
            .serialize()
            .to_vec();
        let mut trimmed = self.trimmed_copy();

        for index in 0..self.vin.len() {
            let locked_hash = Self::referenced_output(&self.vin[index], prev_txs)?
                .pubkey_hash
                .clone();
            trimmed.vin[index].signature = Vec::new();
            trimmed.vin[index].pubkey = locked_hash;
            let digest = trimmed.compute_id();
            trimmed.vin[index].pubkey = Vec::new();

            let message =
                Message::from_digest_slice(&digest).map_err(|_| TxError::SignatureInvalid)?;
            let signature = secp.sign_ecdsa(&message, secret_key);
            self.vin[index].signature = signature.serialize_der().to_vec();
            self.vin[index].pubkey = pubkey.clone();
        }
        Ok(())
    }

    /// Verifies every input signature against its referenced output.
    /// Malformed DER or pubkey bytes fail verification rather than
    /// surfacing a decode error.
    pub fn verify(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<(), TxError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let secp = Secp256k1::new();
        let mut trimmed = self.trimmed_copy();

        for (index, input) in self.vin.iter().enumerate() {
            let locked_hash = Self::referenced_output(input, prev_txs)?.pubkey_hash.clone();
            trimmed.vin[index].signature = Vec::new();
            trimmed.vin[index].pubkey = locked_hash;
            let digest = trimmed.compute_id();
            trimmed.vin[index].pubkey = Vec::new();

            let message =
                Message::from_digest_slice(&digest).map_err(|_| TxError::SignatureInvalid)?;
            let signature =
                Signature::from_der(&input.signature).map_err(|_| TxError::SignatureInvalid)?;
            let pubkey =
                PublicKey::from_slice(&input.pubkey).map_err(|_| TxError::SignatureInvalid)?;
            secp.verify_ecdsa(&message, &signature, &pubkey)
                .map_err(|_| TxError::SignatureInvalid)?;
        }
        Ok(())
    }
}
