//! Node internals: gossip server, wire messages, RPC, mempool, mining
//! loop and wallet file handling. The `minibit` binary drives these
//! from its CLI.

pub mod mempool;
pub mod message;
pub mod miner;
pub mod rpc;
pub mod server;
pub mod wallet;
