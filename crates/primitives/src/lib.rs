//! Core block/transaction types and canonical serialization.

pub mod address;
pub mod block;
pub mod encoding;
pub mod hash;
pub mod transaction;

pub use address::{
    address_from_pubkey_hash, pubkey_hash_from_address, validate_address, AddressError,
};
pub use block::Block;
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{hash160, hash_from_hex, hash_to_hex, sha256, sha256d, Hash256};
pub use transaction::{Transaction, TxError, TxInput, TxOutput, SUBSIDY};
