//! Mining loop: drains the mempool into a candidate block every
//! interval, runs proof-of-work off the async runtime and announces
//! the result.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use minibit_chain::UtxoSet;
use minibit_primitives::{hash_to_hex, Block, Hash256, Transaction};
use minibit_storage::KeyValueStore;

use crate::message::KIND_BLOCK;
use crate::server::Node;

const MINE_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run<S: KeyValueStore + 'static>(node: Arc<Node<S>>, reward_address: String) {
    info!("mining loop started");
    loop {
        tokio::time::sleep(MINE_INTERVAL).await;
        if node.is_shutdown() {
            info!("mining loop stopped");
            return;
        }
        if let Err(err) = mine_round(&node, &reward_address).await {
            warn!("mining round skipped: {err}");
        }
    }
}

async fn mine_round<S: KeyValueStore + 'static>(
    node: &Arc<Node<S>>,
    reward_address: &str,
) -> Result<(), String> {
    let mut txs = select_transactions(node)?;
    // The coinbase is appended after the pending transactions; being a
    // coinbase is a property of the transaction, not of its position.
    let coinbase =
        Transaction::coinbase(reward_address, None).map_err(|err| err.to_string())?;
    txs.push(coinbase);

    let tip = node.chain().tip_info();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    let candidate = Block::candidate(timestamp, tip.height + 1, tip.hash, txs);

    // Run the nonce search off the async runtime; a watcher flips the
    // cancel flag if shutdown is requested mid-search.
    let cancel = Arc::new(AtomicBool::new(false));
    let watcher_cancel = Arc::clone(&cancel);
    let shutdown_probe = Arc::clone(node);
    let watcher = tokio::spawn(async move {
        while !shutdown_probe.is_shutdown() {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        watcher_cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    });
    let pow_block = candidate.clone();
    let result = tokio::task::spawn_blocking(move || minibit_pow::mine(&pow_block, cancel.as_ref()))
        .await
        .map_err(|err| err.to_string())?;
    watcher.abort();
    let (nonce, hash) = result.map_err(|err| err.to_string())?;

    let mut block = candidate;
    block.nonce = nonce;
    block.hash = hash;

    // The tip may have moved while we were hashing; the append check
    // rejects the stale candidate and we try again next round.
    node.chain()
        .add_block(&block)
        .map_err(|err| node.fatal_on_store(err))?;
    info!(
        block = %hash_to_hex(&block.hash),
        height = block.height,
        txs = block.transactions.len(),
        "mined block"
    );

    node.mempool().clear_block(&block);
    node.broadcast_inv(KIND_BLOCK, vec![block.hash]).await;
    Ok(())
}

/// Mempool snapshot filtered to transactions that verify against the
/// chain and whose inputs are still unspent, with conflicting spends
/// deduplicated. Transactions whose inputs are already gone can never
/// become valid and are dropped from the pool.
fn select_transactions<S: KeyValueStore + 'static>(
    node: &Arc<Node<S>>,
) -> Result<Vec<Transaction>, String> {
    let chain = node.chain();
    let utxo = UtxoSet::new(chain.as_ref());
    let mut selected = Vec::new();
    let mut claimed: HashSet<(Hash256, i64)> = HashSet::new();

    for tx in node.mempool().drain() {
        let txid = hash_to_hex(&tx.id);
        if let Err(err) = chain.verify_transaction(&tx) {
            let err = node.fatal_on_store(err);
            warn!(txid = %txid, "skipping invalid mempool tx: {err}");
            continue;
        }

        let mut spendable = true;
        let mut gone = false;
        for input in &tx.vin {
            let Some(ref_txid) = input.txid else {
                spendable = false;
                break;
            };
            if claimed.contains(&(ref_txid, input.vout)) {
                spendable = false;
                break;
            }
            match utxo.has_output(&ref_txid, input.vout) {
                Ok(true) => {}
                Ok(false) => {
                    spendable = false;
                    gone = true;
                    break;
                }
                Err(err) => return Err(node.fatal_on_store(err)),
            }
        }
        if !spendable {
            if gone {
                // Its input was spent by a mined block; unminable.
                warn!(txid = %txid, "dropping mempool tx with spent inputs");
                node.mempool().remove(&txid);
            }
            continue;
        }

        for input in &tx.vin {
            if let Some(ref_txid) = input.txid {
                claimed.insert((ref_txid, input.vout));
            }
        }
        selected.push(tx);
    }
    Ok(selected)
}
