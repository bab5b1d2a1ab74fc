//! Wallet keypairs and the per-port wallet file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use secp256k1::{Secp256k1, SecretKey};

use minibit_primitives::{
    address_from_pubkey_hash, hash160, DecodeError, Decoder, Encoder,
};

#[derive(Debug)]
pub enum WalletError {
    Io(io::Error),
    Codec(DecodeError),
    BadKey,
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletError::Io(err) => write!(f, "wallet file error: {err}"),
            WalletError::Codec(err) => write!(f, "wallet file is malformed: {err}"),
            WalletError::BadKey => write!(f, "wallet file holds an invalid key"),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<io::Error> for WalletError {
    fn from(err: io::Error) -> Self {
        WalletError::Io(err)
    }
}

impl From<DecodeError> for WalletError {
    fn from(err: DecodeError) -> Self {
        WalletError::Codec(err)
    }
}

#[derive(Clone)]
pub struct Wallet {
    pub secret_key: SecretKey,
    /// Compressed secp256k1 public key, 33 bytes.
    pub pubkey: Vec<u8>,
}

impl Wallet {
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut rand::thread_rng());
        Self {
            secret_key,
            pubkey: public_key.serialize().to_vec(),
        }
    }

    pub fn address(&self) -> String {
        address_from_pubkey_hash(&hash160(&self.pubkey))
    }
}

/// Address-keyed wallet collection persisted to `wallet_<port>.dat`.
/// Entries are written sorted by address so the file bytes are stable.
#[derive(Default)]
pub struct Wallets {
    entries: BTreeMap<String, Wallet>,
}

impl Wallets {
    pub fn file_name(port: u16) -> String {
        format!("wallet_{port}.dat")
    }

    /// Loads the wallet file for `port`; a missing file is an empty
    /// collection.
    pub fn load(port: u16) -> Result<Self, WalletError> {
        let path = Self::file_name(port);
        if !Path::new(&path).exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(&path)?;
        Self::decode(&bytes)
    }

    pub fn save(&self, port: u16) -> Result<(), WalletError> {
        fs::write(Self::file_name(port), self.encode())?;
        Ok(())
    }

    /// Generates a wallet, adds it and returns its address.
    pub fn create(&mut self) -> String {
        let wallet = Wallet::generate();
        let address = wallet.address();
        self.entries.insert(address.clone(), wallet);
        address
    }

    pub fn get(&self, address: &str) -> Option<&Wallet> {
        self.entries.get(address)
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_varint(self.entries.len() as u64);
        for (address, wallet) in &self.entries {
            encoder.write_var_str(address);
            encoder.write_var_bytes(&wallet.secret_key.secret_bytes());
            encoder.write_var_bytes(&wallet.pubkey);
        }
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, WalletError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_varint()?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let address = decoder.read_var_str()?;
            let secret_bytes = decoder.read_var_bytes()?;
            let pubkey = decoder.read_var_bytes()?;
            let secret_key =
                SecretKey::from_slice(&secret_bytes).map_err(|_| WalletError::BadKey)?;
            entries.insert(address, Wallet { secret_key, pubkey });
        }
        decoder.finish()?;
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minibit_primitives::validate_address;

    #[test]
    fn generated_address_validates() {
        let wallet = Wallet::generate();
        assert!(validate_address(&wallet.address()));
        assert_eq!(wallet.pubkey.len(), 33);
    }

    #[test]
    fn file_round_trip() {
        let mut wallets = Wallets::default();
        let first = wallets.create();
        let second = wallets.create();

        let decoded = Wallets::decode(&wallets.encode()).unwrap();
        for address in [&first, &second] {
            let original = wallets.get(address).unwrap();
            let restored = decoded.get(address).unwrap();
            assert_eq!(original.pubkey, restored.pubkey);
            assert_eq!(
                original.secret_key.secret_bytes(),
                restored.secret_key.secret_bytes()
            );
            assert_eq!(&restored.address(), address);
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut wallets = Wallets::default();
        wallets.create();
        wallets.create();
        assert_eq!(wallets.encode(), wallets.encode());
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let mut bytes = {
            let mut wallets = Wallets::default();
            wallets.create();
            wallets.encode()
        };
        bytes.truncate(bytes.len() - 1);
        assert!(Wallets::decode(&bytes).is_err());
    }
}
