//! Chain storage engine: genesis installation, validated atomic block
//! append, backward iteration and UTXO-set maintenance.

mod chain;
mod utxo;

pub use chain::{Chain, ChainError, ChainIterator, ChainTip, TIP_KEY};
pub use utxo::{decode_outputs, encode_outputs, UtxoSet};
