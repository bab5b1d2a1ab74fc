//! Proof-of-work: target derivation, header preimage assembly and the
//! cancellable nonce search.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use primitive_types::U256;

use minibit_primitives::{sha256, Block, Hash256};

/// Required number of leading zero bits in a block hash. Fixed; there
/// is no retargeting.
pub const TARGET_BITS: u32 = 16;

const MAX_NONCE: i64 = i64::MAX;

/// The nonce loop polls the cancel flag once per this many attempts.
const CANCEL_CHECK_INTERVAL: i64 = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowError {
    Exhausted,
    Cancelled,
}

impl fmt::Display for PowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowError::Exhausted => write!(f, "nonce space exhausted"),
            PowError::Cancelled => write!(f, "mining cancelled"),
        }
    }
}

impl std::error::Error for PowError {}

/// `1 << (256 - TARGET_BITS)`; a hash wins iff, read as a big-endian
/// 256-bit integer, it is strictly below this.
pub fn target() -> U256 {
    U256::one() << (256 - TARGET_BITS as usize)
}

/// Canonical header preimage: prev hash bytes, the SHA-256 over all
/// transaction ids, then timestamp, target bits, nonce and height as
/// ASCII decimal. Peers recompute this byte-for-byte, so the layout is
/// part of the protocol.
pub fn header_preimage(block: &Block, nonce: i64) -> Vec<u8> {
    let mut data = Vec::with_capacity(128);
    data.extend_from_slice(block.prev_hash_bytes());
    data.extend_from_slice(&block.hash_transactions());
    data.extend_from_slice(block.timestamp.to_string().as_bytes());
    data.extend_from_slice(TARGET_BITS.to_string().as_bytes());
    data.extend_from_slice(nonce.to_string().as_bytes());
    data.extend_from_slice(block.height.to_string().as_bytes());
    data
}

pub fn hash_meets_target(hash: &Hash256) -> bool {
    U256::from_big_endian(hash) < target()
}

/// Searches nonces from zero until the header hash meets the target.
/// Checks `cancel` periodically so a mining task can be stopped.
pub fn mine(block: &Block, cancel: &AtomicBool) -> Result<(i64, Hash256), PowError> {
    let target = target();
    let mut nonce = 0i64;
    while nonce < MAX_NONCE {
        if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            return Err(PowError::Cancelled);
        }
        let hash = sha256(&header_preimage(block, nonce));
        if U256::from_big_endian(&hash) < target {
            return Ok((nonce, hash));
        }
        nonce += 1;
    }
    Err(PowError::Exhausted)
}

/// Recomputes the header hash with the block's stored nonce; the block
/// is valid iff that hash meets the target and equals the stored hash.
pub fn validate(block: &Block) -> bool {
    let hash = sha256(&header_preimage(block, block.nonce));
    hash_meets_target(&hash) && hash == block.hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use minibit_primitives::Transaction;

    const ADDRESS: &str = "1NAf8sFhcm2L2vjF1Yc1sMpHgXUaA7dGjN";

    fn candidate(height: i64) -> Block {
        let coinbase = Transaction::coinbase(ADDRESS, Some(b"pow test".to_vec())).unwrap();
        Block::candidate(1_700_000_000, height, [0x11u8; 32], vec![coinbase])
    }

    #[test]
    fn preimage_layout_is_ascii_decimal() {
        let mut block = candidate(7);
        block.timestamp = -5;
        let preimage = header_preimage(&block, 123);

        let mut expected = Vec::new();
        expected.extend_from_slice(&[0x11u8; 32]);
        expected.extend_from_slice(&block.hash_transactions());
        expected.extend_from_slice(b"-5");
        expected.extend_from_slice(b"16");
        expected.extend_from_slice(b"123");
        expected.extend_from_slice(b"7");
        assert_eq!(preimage, expected);
    }

    #[test]
    fn preimage_of_genesis_has_no_prev_bytes() {
        let mut block = candidate(0);
        block.prev_hash = None;
        let preimage = header_preimage(&block, 0);
        assert_eq!(&preimage[..32], &block.hash_transactions());
    }

    #[test]
    fn mine_then_validate() {
        let mut block = candidate(1);
        let cancel = AtomicBool::new(false);
        let (nonce, hash) = mine(&block, &cancel).unwrap();
        block.nonce = nonce;
        block.hash = hash;
        assert!(validate(&block));
        assert!(hash_meets_target(&hash));
    }

    #[test]
    fn tampered_nonce_fails_validation() {
        let mut block = candidate(1);
        let cancel = AtomicBool::new(false);
        let (nonce, hash) = mine(&block, &cancel).unwrap();
        block.nonce = nonce + 1;
        block.hash = hash;
        assert!(!validate(&block));
    }

    #[test]
    fn stored_hash_must_match_recomputed() {
        let mut block = candidate(1);
        let cancel = AtomicBool::new(false);
        let (nonce, mut hash) = mine(&block, &cancel).unwrap();
        block.nonce = nonce;
        hash[31] ^= 0x01;
        block.hash = hash;
        assert!(!validate(&block));
    }

    #[test]
    fn cancel_flag_stops_search() {
        let block = candidate(1);
        let cancel = AtomicBool::new(true);
        assert_eq!(mine(&block, &cancel), Err(PowError::Cancelled));
    }
}
