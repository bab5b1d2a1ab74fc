//! Request/response RPC on the peer port + 1000: both sides exchange
//! one encoded envelope and close.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use minibit_chain::{ChainError, UtxoSet};
use minibit_primitives::{
    hash_to_hex, pubkey_hash_from_address, validate_address, DecodeError, Decoder, Encoder,
};
use minibit_storage::KeyValueStore;

use crate::message::{self, command_bytes, command_from_bytes, COMMAND_LEN};
use crate::server::Node;
use crate::wallet::Wallets;

pub const RPC_PORT_OFFSET: u16 = 1000;

pub const CMD_GET_BALANCE: &str = "getbalance";
pub const CMD_SEND_TX: &str = "sendtx";
pub const CMD_BEST_HEIGHT: &str = "getbestheight";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcRequest {
    pub command: String,
    pub payload: Vec<u8>,
}

impl RpcRequest {
    pub fn new(command: &str, payload: Vec<u8>) -> Self {
        Self {
            command: command.to_string(),
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_bytes(&command_bytes(&self.command));
        encoder.write_var_bytes(&self.payload);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let command = command_from_bytes(&decoder.read_fixed::<COMMAND_LEN>()?);
        let payload = decoder.read_var_bytes()?;
        decoder.finish()?;
        Ok(Self { command, payload })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcResponse {
    pub success: bool,
    pub message: String,
    pub data: Vec<u8>,
}

impl RpcResponse {
    pub fn ok(message: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(u8::from(self.success));
        encoder.write_var_str(&self.message);
        encoder.write_var_bytes(&self.data);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let success = decoder.read_u8()? != 0;
        let message = decoder.read_var_str()?;
        let data = decoder.read_var_bytes()?;
        decoder.finish()?;
        Ok(Self {
            success,
            message,
            data,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBalanceRequest {
    pub address: String,
}

impl GetBalanceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.address);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let address = decoder.read_var_str()?;
        decoder.finish()?;
        Ok(Self { address })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBalanceResponse {
    pub balance: i64,
}

impl GetBalanceResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.balance);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let balance = decoder.read_i64_le()?;
        decoder.finish()?;
        Ok(Self { balance })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendRequest {
    pub from: String,
    pub to: String,
    pub amount: i64,
}

impl SendRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.from);
        encoder.write_var_str(&self.to);
        encoder.write_i64_le(self.amount);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let from = decoder.read_var_str()?;
        let to = decoder.read_var_str()?;
        let amount = decoder.read_i64_le()?;
        decoder.finish()?;
        Ok(Self { from, to, amount })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BestHeightResponse {
    pub height: i64,
}

impl BestHeightResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.height);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_i64_le()?;
        decoder.finish()?;
        Ok(Self { height })
    }
}

pub async fn serve<S: KeyValueStore + 'static>(node: Arc<Node<S>>, listener: TcpListener) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!("rpc accept failed: {err}");
                continue;
            }
        };
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(node, stream).await {
                debug!("rpc connection closed: {err}");
            }
        });
    }
}

async fn handle_connection<S: KeyValueStore + 'static>(
    node: Arc<Node<S>>,
    mut stream: TcpStream,
) -> Result<(), String> {
    let bytes = message::read_to_end(&mut stream).await?;
    let response = match RpcRequest::decode(&bytes) {
        Ok(request) => {
            debug!(command = %request.command, "rpc request");
            dispatch(&node, request).await
        }
        Err(err) => RpcResponse::error(format!("malformed rpc request: {err}")),
    };
    stream
        .write_all(&response.encode())
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

async fn dispatch<S: KeyValueStore + 'static>(
    node: &Arc<Node<S>>,
    request: RpcRequest,
) -> RpcResponse {
    match request.command.as_str() {
        CMD_GET_BALANCE => get_balance(node, &request.payload),
        CMD_SEND_TX => send_tx(node, &request.payload).await,
        CMD_BEST_HEIGHT => best_height(node),
        other => RpcResponse::error(format!("unknown rpc command '{other}'")),
    }
}

fn get_balance<S: KeyValueStore + 'static>(node: &Arc<Node<S>>, payload: &[u8]) -> RpcResponse {
    let request = match GetBalanceRequest::decode(payload) {
        Ok(request) => request,
        Err(err) => return RpcResponse::error(format!("malformed getbalance request: {err}")),
    };
    let pubkey_hash = match pubkey_hash_from_address(&request.address) {
        Ok(hash) => hash,
        Err(err) => return RpcResponse::error(format!("invalid address: {err}")),
    };
    let utxo = UtxoSet::new(node.chain().as_ref());
    match utxo.balance(&pubkey_hash) {
        Ok(balance) => RpcResponse::ok("", GetBalanceResponse { balance }.encode()),
        Err(err) => RpcResponse::error(node.fatal_on_store(err)),
    }
}

async fn send_tx<S: KeyValueStore + 'static>(node: &Arc<Node<S>>, payload: &[u8]) -> RpcResponse {
    let request = match SendRequest::decode(payload) {
        Ok(request) => request,
        Err(err) => return RpcResponse::error(format!("malformed sendtx request: {err}")),
    };
    if !validate_address(&request.from) || !validate_address(&request.to) || request.amount <= 0 {
        return RpcResponse::error("invalid send request parameters");
    }

    let wallets = match Wallets::load(node.port()) {
        Ok(wallets) => wallets,
        Err(err) => return RpcResponse::error(format!("wallet file unavailable: {err}")),
    };
    let Some(wallet) = wallets.get(&request.from) else {
        return RpcResponse::error("sender wallet not found in this node's wallet file");
    };

    let utxo = UtxoSet::new(node.chain().as_ref());
    let tx = match utxo.build_transfer(
        &wallet.secret_key,
        &wallet.pubkey,
        &request.to,
        request.amount,
    ) {
        Ok(tx) => tx,
        Err(err @ ChainError::InsufficientFunds { .. }) => {
            return RpcResponse::error(err.to_string())
        }
        Err(err) => {
            return RpcResponse::error(format!(
                "transaction creation failed: {}",
                node.fatal_on_store(err)
            ))
        }
    };

    let txid = hash_to_hex(&tx.id);
    node.mempool().add(tx.clone());
    node.broadcast_tx(&tx, node.addr()).await;
    RpcResponse::ok(txid.clone(), tx.id.to_vec())
}

fn best_height<S: KeyValueStore + 'static>(node: &Arc<Node<S>>) -> RpcResponse {
    RpcResponse::ok(
        "",
        BestHeightResponse {
            height: node.chain().best_height(),
        }
        .encode(),
    )
}

/// One-shot RPC client used by the CLI: dial, write one envelope,
/// half-close, read one response.
pub async fn call(port: u16, command: &str, payload: Vec<u8>) -> Result<RpcResponse, String> {
    let addr = format!("localhost:{}", port + RPC_PORT_OFFSET);
    let mut stream = TcpStream::connect(&addr)
        .await
        .map_err(|err| format!("node at port {port} is not running ({addr}: {err})"))?;
    stream
        .write_all(&RpcRequest::new(command, payload).encode())
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;

    let bytes = message::read_to_end(&mut stream).await?;
    if bytes.is_empty() {
        return Err(format!("empty rpc response from node at port {port}"));
    }
    RpcResponse::decode(&bytes).map_err(|err| format!("malformed rpc response: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let request = RpcRequest::new(CMD_GET_BALANCE, b"payload".to_vec());
        assert_eq!(RpcRequest::decode(&request.encode()).unwrap(), request);

        let response = RpcResponse::ok("done", vec![1, 2, 3]);
        assert_eq!(RpcResponse::decode(&response.encode()).unwrap(), response);

        let failure = RpcResponse::error("nope");
        let decoded = RpcResponse::decode(&failure.encode()).unwrap();
        assert!(!decoded.success);
        assert_eq!(decoded.message, "nope");
    }

    #[test]
    fn payload_round_trips() {
        let balance_req = GetBalanceRequest {
            address: "1NAf8sFhcm2L2vjF1Yc1sMpHgXUaA7dGjN".to_string(),
        };
        assert_eq!(
            GetBalanceRequest::decode(&balance_req.encode()).unwrap(),
            balance_req
        );

        let balance_resp = GetBalanceResponse { balance: 42 };
        assert_eq!(
            GetBalanceResponse::decode(&balance_resp.encode()).unwrap(),
            balance_resp
        );

        let send = SendRequest {
            from: "a".to_string(),
            to: "b".to_string(),
            amount: 7,
        };
        assert_eq!(SendRequest::decode(&send.encode()).unwrap(), send);

        let height = BestHeightResponse { height: 5 };
        assert_eq!(
            BestHeightResponse::decode(&height.encode()).unwrap(),
            height
        );
    }
}
