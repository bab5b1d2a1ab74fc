//! Base58check addresses: version byte 0x00 over a 20-byte pubkey
//! hash with a 4-byte double-SHA-256 checksum.

use std::fmt;

use crate::hash::sha256d;

pub const ADDRESS_VERSION: u8 = 0x00;
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressError {
    NotBase58,
    TooShort,
    BadChecksum,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressError::NotBase58 => write!(f, "address is not valid base58"),
            AddressError::TooShort => write!(f, "address payload too short"),
            AddressError::BadChecksum => write!(f, "address checksum mismatch"),
        }
    }
}

impl std::error::Error for AddressError {}

fn checksum(payload: &[u8]) -> [u8; ADDRESS_CHECKSUM_LEN] {
    let digest = sha256d(payload);
    let mut out = [0u8; ADDRESS_CHECKSUM_LEN];
    out.copy_from_slice(&digest[..ADDRESS_CHECKSUM_LEN]);
    out
}

pub fn address_from_pubkey_hash(pubkey_hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(1 + 20 + ADDRESS_CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey_hash);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    bs58::encode(payload).into_string()
}

/// Decodes an address and verifies its checksum, returning the
/// 20-byte pubkey hash it locks to.
pub fn pubkey_hash_from_address(address: &str) -> Result<[u8; 20], AddressError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|_| AddressError::NotBase58)?;
    if decoded.len() < 1 + ADDRESS_CHECKSUM_LEN + 1 {
        return Err(AddressError::TooShort);
    }
    let (payload, check) = decoded.split_at(decoded.len() - ADDRESS_CHECKSUM_LEN);
    if checksum(payload) != check {
        return Err(AddressError::BadChecksum);
    }
    let hash = &payload[1..];
    if hash.len() != 20 {
        return Err(AddressError::TooShort);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(hash);
    Ok(out)
}

pub fn validate_address(address: &str) -> bool {
    pubkey_hash_from_address(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash160;

    #[test]
    fn encode_decode_round_trip() {
        let pubkey_hash = hash160(b"some compressed pubkey");
        let address = address_from_pubkey_hash(&pubkey_hash);
        assert_eq!(pubkey_hash_from_address(&address).unwrap(), pubkey_hash);
        assert!(validate_address(&address));
    }

    #[test]
    fn genesis_address_is_valid() {
        assert!(validate_address("1NAf8sFhcm2L2vjF1Yc1sMpHgXUaA7dGjN"));
    }

    #[test]
    fn tampered_checksum_rejected() {
        let pubkey_hash = hash160(b"key");
        let address = address_from_pubkey_hash(&pubkey_hash);
        let mut tampered = address.into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'2' { b'3' } else { b'2' };
        let tampered = String::from_utf8(tampered).unwrap();
        assert!(!validate_address(&tampered));
    }

    #[test]
    fn garbage_rejected() {
        assert_eq!(
            pubkey_hash_from_address("not/base58!"),
            Err(AddressError::NotBase58)
        );
        assert_eq!(pubkey_hash_from_address("11"), Err(AddressError::TooShort));
    }
}
