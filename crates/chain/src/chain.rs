use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use minibit_primitives::{
    hash_from_hex, hash_to_hex, AddressError, Block, DecodeError, Hash256, Transaction, TxError,
};
use minibit_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::utxo;

/// Reserved key in the blocks column holding the tip hash.
pub const TIP_KEY: &[u8] = b"l";

// Fixed genesis. Installed verbatim on first open; no proof-of-work
// runs at install time.
const GENESIS_TIMESTAMP: i64 = 1_231_006_505;
const GENESIS_NONCE: i64 = 169_686;
const GENESIS_HASH_HEX: &str = "0000f9433df7947fe24d253e0c163649fa2108ad1022005baee6e32997a972be";
const GENESIS_ADDRESS: &str = "1NAf8sFhcm2L2vjF1Yc1sMpHgXUaA7dGjN";
const GENESIS_COINBASE_DATA: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

#[derive(Debug)]
pub enum ChainError {
    PrevHashMismatch { expected: Hash256, found: Option<Hash256> },
    PowInvalid(Hash256),
    EmptyBlock,
    InvalidTx(TxError),
    BlockNotFound(Hash256),
    TxNotFound(Hash256),
    InsufficientFunds { available: i64, required: i64 },
    Address(AddressError),
    Codec(DecodeError),
    Store(StoreError),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::PrevHashMismatch { expected, found } => {
                let found = match found {
                    Some(hash) => hash_to_hex(hash),
                    None => "(empty)".to_string(),
                };
                write!(
                    f,
                    "block does not extend the tip: expected prev {}, got {found}",
                    hash_to_hex(expected)
                )
            }
            ChainError::PowInvalid(hash) => {
                write!(f, "proof-of-work check failed for block {}", hash_to_hex(hash))
            }
            ChainError::EmptyBlock => write!(f, "block carries no transactions"),
            ChainError::InvalidTx(err) => write!(f, "invalid transaction: {err}"),
            ChainError::BlockNotFound(hash) => {
                write!(f, "block {} not found", hash_to_hex(hash))
            }
            ChainError::TxNotFound(txid) => {
                write!(f, "transaction {} not found", hash_to_hex(txid))
            }
            ChainError::InsufficientFunds {
                available,
                required,
            } => {
                write!(f, "not enough funds: available {available}, required {required}")
            }
            ChainError::Address(err) => write!(f, "{err}"),
            ChainError::Codec(err) => write!(f, "stored value is malformed: {err}"),
            ChainError::Store(err) => write!(f, "store failure: {err}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

impl From<DecodeError> for ChainError {
    fn from(err: DecodeError) -> Self {
        ChainError::Codec(err)
    }
}

impl From<AddressError> for ChainError {
    fn from(err: AddressError) -> Self {
        ChainError::Address(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i64,
}

/// The chain owns the store handle. `append_lock` serializes the
/// whole validate-commit-update path so the tip cannot move under an
/// in-flight append; `tip` itself is only held for short reads and the
/// final update, so readers always observe a committed tip.
pub struct Chain<S> {
    store: Arc<S>,
    tip: Mutex<ChainTip>,
    append_lock: Mutex<()>,
}

impl<S: KeyValueStore> Chain<S> {
    /// Opens the chain, installing the fixed genesis block if the
    /// store is empty.
    pub fn open(store: Arc<S>) -> Result<Self, ChainError> {
        let tip = match store.get(Column::Blocks, TIP_KEY)? {
            Some(tip_bytes) => {
                let hash = hash_from_slice(&tip_bytes)?;
                let block = load_block(store.as_ref(), &hash)?;
                ChainTip {
                    hash,
                    height: block.height,
                }
            }
            None => install_genesis(store.as_ref())?,
        };
        Ok(Self {
            store,
            tip: Mutex::new(tip),
            append_lock: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn tip_info(&self) -> ChainTip {
        *lock_unpoisoned(&self.tip)
    }

    pub fn best_height(&self) -> i64 {
        self.tip_info().height
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
        load_block(self.store.as_ref(), hash)
    }

    pub fn has_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.store.get(Column::Blocks, hash)?.is_some())
    }

    /// Backward cursor from the tip down to genesis.
    pub fn iter(&self) -> ChainIterator<'_, S> {
        ChainIterator {
            chain: self,
            current: Some(self.tip_info().hash),
        }
    }

    /// All block hashes, most recent first.
    pub fn block_hashes(&self) -> Result<Vec<Hash256>, ChainError> {
        let mut hashes = Vec::new();
        for block in self.iter() {
            hashes.push(block?.hash);
        }
        Ok(hashes)
    }

    /// Linear scan for a transaction by id.
    pub fn find_tx(&self, txid: &Hash256) -> Result<Transaction, ChainError> {
        for block in self.iter() {
            let block = block?;
            for tx in block.transactions {
                if &tx.id == txid {
                    return Ok(tx);
                }
            }
        }
        Err(ChainError::TxNotFound(*txid))
    }

    /// Every transaction referenced by `tx`'s inputs, keyed by id.
    pub fn referenced_txs(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<Hash256, Transaction>, ChainError> {
        let mut prev_txs = HashMap::new();
        for input in &tx.vin {
            let txid = input
                .txid
                .ok_or(ChainError::InvalidTx(TxError::CoinbaseMalformed))?;
            if prev_txs.contains_key(&txid) {
                continue;
            }
            let prev = self
                .find_tx(&txid)
                .map_err(|err| match err {
                    ChainError::TxNotFound(txid) => {
                        ChainError::InvalidTx(TxError::PrevTxMissing(txid))
                    }
                    other => other,
                })?;
            prev_txs.insert(txid, prev);
        }
        Ok(prev_txs)
    }

    /// Signature and referential-integrity check against the chain.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<(), ChainError> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let prev_txs = self.referenced_txs(tx)?;
        tx.verify(&prev_txs).map_err(ChainError::InvalidTx)
    }

    /// Appends a block that extends the current tip. Validation
    /// failures leave the store untouched; on success the block, the
    /// tip key and the UTXO deltas commit in one batch.
    pub fn add_block(&self, block: &Block) -> Result<(), ChainError> {
        let _append = lock_unpoisoned(&self.append_lock);
        let tip = self.tip_info();

        if block.prev_hash != Some(tip.hash) {
            return Err(ChainError::PrevHashMismatch {
                expected: tip.hash,
                found: block.prev_hash,
            });
        }
        if block.transactions.is_empty() {
            return Err(ChainError::EmptyBlock);
        }
        if !minibit_pow::validate(block) {
            return Err(ChainError::PowInvalid(block.hash));
        }
        for tx in &block.transactions {
            self.verify_transaction(tx)?;
        }

        let mut batch = WriteBatch::new();
        batch.put(Column::Blocks, block.hash.to_vec(), block.encode());
        batch.put(Column::Blocks, TIP_KEY, block.hash.to_vec());
        utxo::stage_block_update(self.store.as_ref(), &mut batch, block)?;
        self.store.write_batch(&batch)?;

        *lock_unpoisoned(&self.tip) = ChainTip {
            hash: block.hash,
            height: block.height,
        };
        Ok(())
    }

    /// Full-chain UTXO scan: txid to unspent (index, output) pairs.
    /// Used by reindex; the incremental path lives in the utxo module.
    pub fn find_all_utxo(
        &self,
    ) -> Result<HashMap<Hash256, Vec<(u32, minibit_primitives::TxOutput)>>, ChainError> {
        let mut unspent: HashMap<Hash256, Vec<(u32, minibit_primitives::TxOutput)>> =
            HashMap::new();
        let mut spent: HashMap<Hash256, Vec<i64>> = HashMap::new();

        for block in self.iter() {
            let block = block?;
            for tx in &block.transactions {
                let spent_here = spent.get(&tx.id);
                let mut outputs = Vec::new();
                for (index, output) in tx.vout.iter().enumerate() {
                    let index = index as i64;
                    if spent_here.is_some_and(|list| list.contains(&index)) {
                        continue;
                    }
                    outputs.push((index as u32, output.clone()));
                }
                if !outputs.is_empty() {
                    unspent.insert(tx.id, outputs);
                }
                if !tx.is_coinbase() {
                    for input in &tx.vin {
                        if let Some(txid) = input.txid {
                            spent.entry(txid).or_default().push(input.vout);
                        }
                    }
                }
            }
        }
        Ok(unspent)
    }
}

pub struct ChainIterator<'a, S> {
    chain: &'a Chain<S>,
    current: Option<Hash256>,
}

impl<S: KeyValueStore> Iterator for ChainIterator<'_, S> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current?;
        match self.chain.get_block(&hash) {
            Ok(block) => {
                // Genesis has no previous hash; the cursor stops here.
                self.current = block.prev_hash;
                Some(Ok(block))
            }
            Err(err) => {
                self.current = None;
                Some(Err(err))
            }
        }
    }
}

fn install_genesis<S: KeyValueStore>(store: &S) -> Result<ChainTip, ChainError> {
    let coinbase =
        Transaction::coinbase(GENESIS_ADDRESS, Some(GENESIS_COINBASE_DATA.to_vec()))?;
    let hash = hash_from_hex(GENESIS_HASH_HEX).ok_or(ChainError::Codec(
        DecodeError::InvalidHashLength,
    ))?;
    let genesis = Block {
        timestamp: GENESIS_TIMESTAMP,
        height: 0,
        prev_hash: None,
        hash,
        nonce: GENESIS_NONCE,
        transactions: vec![coinbase],
    };

    let mut batch = WriteBatch::new();
    batch.put(Column::Blocks, genesis.hash.to_vec(), genesis.encode());
    batch.put(Column::Blocks, TIP_KEY, genesis.hash.to_vec());
    utxo::stage_block_update(store, &mut batch, &genesis)?;
    store.write_batch(&batch)?;

    Ok(ChainTip {
        hash: genesis.hash,
        height: 0,
    })
}

fn load_block<S: KeyValueStore>(store: &S, hash: &Hash256) -> Result<Block, ChainError> {
    let bytes = store
        .get(Column::Blocks, hash)?
        .ok_or(ChainError::BlockNotFound(*hash))?;
    Ok(Block::decode(&bytes)?)
}

fn hash_from_slice(bytes: &[u8]) -> Result<Hash256, ChainError> {
    if bytes.len() != 32 {
        return Err(ChainError::Codec(DecodeError::InvalidHashLength));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
