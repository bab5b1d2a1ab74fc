//! Block type and canonical codec.

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::{sha256, Hash256};
use crate::transaction::Transaction;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub timestamp: i64,
    pub height: i64,
    /// `None` only for the genesis block.
    pub prev_hash: Option<Hash256>,
    pub hash: Hash256,
    pub nonce: i64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Candidate block awaiting proof-of-work; `hash` and `nonce` are
    /// filled in by the miner.
    pub fn candidate(
        timestamp: i64,
        height: i64,
        prev_hash: Hash256,
        transactions: Vec<Transaction>,
    ) -> Self {
        Self {
            timestamp,
            height,
            prev_hash: Some(prev_hash),
            hash: [0u8; 32],
            nonce: 0,
            transactions,
        }
    }

    /// SHA-256 of the concatenated transaction ids, in block order.
    /// Feeds the proof-of-work preimage.
    pub fn hash_transactions(&self) -> Hash256 {
        let mut joined = Vec::with_capacity(self.transactions.len() * 32);
        for tx in &self.transactions {
            joined.extend_from_slice(&tx.id);
        }
        sha256(&joined)
    }

    pub fn prev_hash_bytes(&self) -> &[u8] {
        match &self.prev_hash {
            Some(hash) => hash,
            None => &[],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.timestamp);
        encoder.write_i64_le(self.height);
        encoder.write_i64_le(self.nonce);
        encoder.write_var_bytes(self.prev_hash_bytes());
        encoder.write_bytes(&self.hash);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let timestamp = decoder.read_i64_le()?;
        let height = decoder.read_i64_le()?;
        let nonce = decoder.read_i64_le()?;
        let prev_bytes = decoder.read_var_bytes()?;
        let prev_hash = match prev_bytes.len() {
            0 => None,
            32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&prev_bytes);
                Some(hash)
            }
            _ => return Err(DecodeError::InvalidHashLength),
        };
        let hash = decoder.read_fixed::<32>()?;
        let tx_count = decoder.read_varint()?;
        let mut transactions = Vec::with_capacity(tx_count.min(1024) as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            timestamp,
            height,
            prev_hash,
            hash,
            nonce,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let coinbase =
            Transaction::coinbase("1NAf8sFhcm2L2vjF1Yc1sMpHgXUaA7dGjN", Some(b"data".to_vec()))
                .unwrap();
        Block {
            timestamp: 1_231_006_505,
            height: 3,
            prev_hash: Some([7u8; 32]),
            hash: [9u8; 32],
            nonce: 42,
            transactions: vec![coinbase],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let block = sample_block();
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn genesis_prev_hash_encodes_empty() {
        let mut block = sample_block();
        block.prev_hash = None;
        let decoded = Block::decode(&block.encode()).unwrap();
        assert_eq!(decoded.prev_hash, None);
        assert_eq!(decoded.prev_hash_bytes(), &[] as &[u8]);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample_block().encode();
        bytes.push(0xaa);
        assert_eq!(Block::decode(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn hash_transactions_depends_on_order() {
        let mut block = sample_block();
        let extra =
            Transaction::coinbase("1NAf8sFhcm2L2vjF1Yc1sMpHgXUaA7dGjN", Some(b"other".to_vec()))
                .unwrap();
        block.transactions.push(extra);
        let forward = block.hash_transactions();
        block.transactions.reverse();
        assert_ne!(forward, block.hash_transactions());
    }
}
