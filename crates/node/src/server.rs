//! Gossip node: peer listener, handshake, inventory-driven block sync
//! and transaction flooding.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use minibit_chain::{Chain, ChainError, UtxoSet};
use minibit_primitives::{hash_to_hex, Block, Hash256, Transaction};
use minibit_storage::KeyValueStore;

use crate::mempool::Mempool;
use crate::message::{
    self, BlockMsg, GetBlocksMsg, GetDataMsg, InvMsg, TxMsg, VersionMsg, KIND_BLOCK, KIND_TX,
};
use crate::{miner, rpc};

pub const PROTOCOL_VERSION: i64 = 1;
pub const BOOTSTRAP_ADDR: &str = "localhost:3000";

/// Grace period before contacting the bootstrap node, so our own
/// listener is up when the reply arrives.
const BOOTSTRAP_CONTACT_DELAY: Duration = Duration::from_secs(2);

pub struct Node<S> {
    addr: String,
    port: u16,
    miner_address: Option<String>,
    chain: Arc<Chain<S>>,
    mempool: Mempool,
    /// Grow-only set of peer addresses; dead peers just fail to dial.
    known_peers: Mutex<HashSet<String>>,
    /// Block hashes awaiting fetch from the current sync peer, oldest
    /// first. Owned by the peer-message path; the miner never touches
    /// it.
    download_queue: Mutex<Vec<Hash256>>,
    shutdown: AtomicBool,
}

impl<S: KeyValueStore + 'static> Node<S> {
    pub fn new(port: u16, chain: Arc<Chain<S>>, miner_address: Option<String>) -> Self {
        let mut known_peers = HashSet::new();
        known_peers.insert(BOOTSTRAP_ADDR.to_string());
        Self {
            addr: format!("localhost:{port}"),
            port,
            miner_address,
            chain,
            mempool: Mempool::new(),
            known_peers: Mutex::new(known_peers),
            download_queue: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn chain(&self) -> &Arc<Chain<S>> {
        &self.chain
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn peers(&self) -> Vec<String> {
        lock(&self.known_peers).iter().cloned().collect()
    }

    pub fn download_queue_len(&self) -> usize {
        lock(&self.download_queue).len()
    }

    fn remember_peer(&self, addr: &str) {
        if addr.is_empty() || addr == self.addr {
            return;
        }
        if lock(&self.known_peers).insert(addr.to_string()) {
            info!(peer = addr, "learned new peer");
        }
    }

    /// Binds both listeners, spawns the RPC loop, the optional mining
    /// loop and the deferred bootstrap contact, then serves peer
    /// connections until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), String> {
        let peer_listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|err| format!("failed to bind peer listener {}: {err}", self.addr))?;
        let rpc_addr = format!("localhost:{}", self.port + rpc::RPC_PORT_OFFSET);
        let rpc_listener = TcpListener::bind(&rpc_addr)
            .await
            .map_err(|err| format!("failed to bind rpc listener {rpc_addr}: {err}"))?;
        info!(peer = %self.addr, rpc = %rpc_addr, "node listening");

        tokio::spawn(rpc::serve(Arc::clone(&self), rpc_listener));

        if let Some(reward_address) = self.miner_address.clone() {
            info!(address = %reward_address, "mining enabled");
            tokio::spawn(miner::run(Arc::clone(&self), reward_address));
        }

        if self.addr != BOOTSTRAP_ADDR {
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                tokio::time::sleep(BOOTSTRAP_CONTACT_DELAY).await;
                node.send_version(BOOTSTRAP_ADDR).await;
            });
        }

        loop {
            let (stream, _) = match peer_listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("peer accept failed: {err}");
                    continue;
                }
            };
            if self.is_shutdown() {
                return Ok(());
            }
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = node.handle_connection(stream).await {
                    debug!("peer connection closed: {err}");
                }
            });
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), String> {
        let request = message::read_to_end(&mut stream).await?;
        drop(stream);
        let (command, payload) = message::split_frame(&request)?;
        debug!(command = %command, bytes = payload.len(), "received command");

        match command.as_str() {
            "version" => self.handle_version(payload).await,
            "getblocks" => self.handle_getblocks(payload).await,
            "inv" => self.handle_inv(payload).await,
            "getdata" => self.handle_getdata(payload).await,
            "block" => self.handle_block(payload).await,
            "tx" => self.handle_tx(payload).await,
            other => {
                debug!(command = other, "unknown command");
                Ok(())
            }
        }
    }

    pub async fn send_version(&self, addr: &str) {
        let payload = VersionMsg {
            version: PROTOCOL_VERSION,
            best_height: self.chain.best_height(),
            addr_from: self.addr.clone(),
        }
        .encode();
        self.send(addr, "version", &payload).await;
    }

    async fn send(&self, addr: &str, command: &str, payload: &[u8]) {
        if let Err(err) = message::send(addr, command, payload).await {
            warn!("{err}");
        }
    }

    async fn handle_version(&self, payload: &[u8]) -> Result<(), String> {
        let version = VersionMsg::decode(payload).map_err(|err| err.to_string())?;
        info!(
            peer = %version.addr_from,
            height = version.best_height,
            "received version"
        );

        let my_height = self.chain.best_height();
        if my_height < version.best_height {
            let payload = GetBlocksMsg {
                addr_from: self.addr.clone(),
            }
            .encode();
            self.send(&version.addr_from, "getblocks", &payload).await;
        } else if my_height > version.best_height {
            self.send_version(&version.addr_from).await;
        }
        self.remember_peer(&version.addr_from);
        Ok(())
    }

    async fn handle_getblocks(&self, payload: &[u8]) -> Result<(), String> {
        let getblocks = GetBlocksMsg::decode(payload).map_err(|err| err.to_string())?;
        let items = self
            .chain
            .block_hashes()
            .map_err(|err| self.fatal_on_store(err))?;
        let payload = InvMsg {
            addr_from: self.addr.clone(),
            kind: KIND_BLOCK.to_string(),
            items,
        }
        .encode();
        self.send(&getblocks.addr_from, "inv", &payload).await;
        Ok(())
    }

    async fn handle_inv(&self, payload: &[u8]) -> Result<(), String> {
        let inv = InvMsg::decode(payload).map_err(|err| err.to_string())?;
        info!(
            peer = %inv.addr_from,
            kind = %inv.kind,
            items = inv.items.len(),
            "received inventory"
        );

        if inv.kind != KIND_BLOCK {
            // tx inventories are reserved, not implemented.
            return Ok(());
        }

        // Keep only hashes we are missing. The sender enumerated its
        // chain newest-first, so reverse to fetch oldest-first.
        let mut to_fetch = Vec::new();
        for hash in &inv.items {
            let known = self
                .chain
                .has_block(hash)
                .map_err(|err| self.fatal_on_store(err))?;
            if !known {
                to_fetch.push(*hash);
            }
        }
        if to_fetch.is_empty() {
            info!(peer = %inv.addr_from, "already synced");
            return Ok(());
        }
        to_fetch.reverse();

        let first = to_fetch[0];
        *lock(&self.download_queue) = to_fetch;
        self.request_block(&inv.addr_from, &first).await;
        Ok(())
    }

    async fn request_block(&self, addr: &str, hash: &Hash256) {
        info!(peer = addr, block = %hash_to_hex(hash), "requesting block");
        let payload = GetDataMsg {
            addr_from: self.addr.clone(),
            kind: KIND_BLOCK.to_string(),
            id: hash.to_vec(),
        }
        .encode();
        self.send(addr, "getdata", &payload).await;
    }

    async fn handle_getdata(&self, payload: &[u8]) -> Result<(), String> {
        let getdata = GetDataMsg::decode(payload).map_err(|err| err.to_string())?;
        match getdata.kind.as_str() {
            KIND_BLOCK => {
                if getdata.id.len() != 32 {
                    return Err("getdata block id has wrong length".to_string());
                }
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&getdata.id);
                match self.chain.get_block(&hash) {
                    Ok(block) => {
                        let payload = BlockMsg {
                            addr_from: self.addr.clone(),
                            block: block.encode(),
                        }
                        .encode();
                        self.send(&getdata.addr_from, "block", &payload).await;
                    }
                    Err(ChainError::BlockNotFound(_)) => {
                        debug!(block = %hash_to_hex(&hash), "getdata for unknown block");
                    }
                    Err(err) => return Err(self.fatal_on_store(err)),
                }
            }
            KIND_TX => {
                let txid = hash_to_hex(&getdata.id);
                if let Some(tx) = self.mempool.get(&txid) {
                    let payload = TxMsg {
                        addr_from: self.addr.clone(),
                        tx: tx.encode(),
                    }
                    .encode();
                    self.send(&getdata.addr_from, "tx", &payload).await;
                } else {
                    debug!(txid = %txid, "getdata for unknown mempool tx");
                }
            }
            other => debug!(kind = other, "getdata for unknown kind"),
        }
        Ok(())
    }

    async fn handle_block(&self, payload: &[u8]) -> Result<(), String> {
        let block_msg = BlockMsg::decode(payload).map_err(|err| err.to_string())?;
        let block = Block::decode(&block_msg.block).map_err(|err| err.to_string())?;
        info!(
            block = %hash_to_hex(&block.hash),
            height = block.height,
            peer = %block_msg.addr_from,
            "received block"
        );

        if let Err(err) = self.chain.add_block(&block) {
            let err = self.fatal_on_store(err);
            warn!(block = %hash_to_hex(&block.hash), "rejected block: {err}");
            // Fail fast: if this peer sent us a bad block we asked
            // for, its inventory cannot be trusted either.
            let mut queue = lock(&self.download_queue);
            if queue.first() == Some(&block.hash) {
                queue.clear();
                info!(peer = %block_msg.addr_from, "download queue cleared");
            }
            return Ok(());
        }

        self.mempool.clear_block(&block);

        let next = {
            let mut queue = lock(&self.download_queue);
            if queue.first() == Some(&block.hash) {
                queue.remove(0);
            }
            queue.first().copied()
        };
        match next {
            Some(hash) => self.request_block(&block_msg.addr_from, &hash).await,
            None => {
                info!("block sync complete, reindexing utxo set");
                let utxo = UtxoSet::new(self.chain.as_ref());
                if let Err(err) = utxo.reindex() {
                    let err = self.fatal_on_store(err);
                    warn!("utxo reindex failed: {err}");
                }
            }
        }
        Ok(())
    }

    async fn handle_tx(&self, payload: &[u8]) -> Result<(), String> {
        let tx_msg = TxMsg::decode(payload).map_err(|err| err.to_string())?;
        let tx = Transaction::decode(&tx_msg.tx).map_err(|err| err.to_string())?;
        let txid = hash_to_hex(&tx.id);

        if self.mempool.exists(&txid) {
            return Ok(());
        }
        if let Err(err) = self.chain.verify_transaction(&tx) {
            let err = self.fatal_on_store(err);
            warn!(txid = %txid, "dropping invalid transaction: {err}");
            return Ok(());
        }
        if self.mempool.add(tx.clone()) {
            info!(txid = %txid, mempool = self.mempool.len(), "added transaction");
            self.broadcast_tx(&tx, &tx_msg.addr_from).await;
        }
        Ok(())
    }

    /// Floods a transaction to every known peer except ourselves and
    /// the peer it came from.
    pub async fn broadcast_tx(&self, tx: &Transaction, exclude: &str) {
        let payload = TxMsg {
            addr_from: self.addr.clone(),
            tx: tx.encode(),
        }
        .encode();
        for peer in self.peers() {
            if peer != self.addr && peer != exclude {
                self.send(&peer, "tx", &payload).await;
            }
        }
    }

    /// Announces inventory to every known peer except ourselves.
    pub async fn broadcast_inv(&self, kind: &str, items: Vec<Hash256>) {
        let payload = InvMsg {
            addr_from: self.addr.clone(),
            kind: kind.to_string(),
            items,
        }
        .encode();
        for peer in self.peers() {
            if peer != self.addr {
                self.send(&peer, "inv", &payload).await;
            }
        }
    }

    /// Store failures are fatal: the chain invariant may be violated,
    /// so the node terminates rather than keep serving.
    pub(crate) fn fatal_on_store(&self, err: ChainError) -> String {
        if let ChainError::Store(store_err) = &err {
            error!("fatal store failure: {store_err}");
            std::process::exit(1);
        }
        err.to_string()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
