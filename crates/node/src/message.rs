//! Gossip wire protocol: a 12-byte zero-padded ASCII command followed
//! by the payload, sender half-closes, receiver reads to EOF.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use minibit_primitives::{DecodeError, Decoder, Encoder, Hash256};

pub const COMMAND_LEN: usize = 12;

/// Cap on a single inbound message so a peer cannot grow the buffer
/// without bound.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

pub const KIND_BLOCK: &str = "block";
pub const KIND_TX: &str = "tx";

pub fn command_bytes(command: &str) -> [u8; COMMAND_LEN] {
    let mut bytes = [0u8; COMMAND_LEN];
    let raw = command.as_bytes();
    let len = raw.len().min(COMMAND_LEN);
    bytes[..len].copy_from_slice(&raw[..len]);
    bytes
}

pub fn command_from_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect()
}

pub fn frame(command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMAND_LEN + payload.len());
    out.extend_from_slice(&command_bytes(command));
    out.extend_from_slice(payload);
    out
}

pub fn split_frame(frame: &[u8]) -> Result<(String, &[u8]), String> {
    if frame.len() < COMMAND_LEN {
        return Err("frame shorter than command header".to_string());
    }
    let command = command_from_bytes(&frame[..COMMAND_LEN]);
    Ok((command, &frame[COMMAND_LEN..]))
}

/// Reads one whole message (to EOF) off the stream, bounded by
/// `MAX_MESSAGE_SIZE`.
pub async fn read_to_end(stream: &mut TcpStream) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Ok(buffer);
        }
        if buffer.len() + read > MAX_MESSAGE_SIZE {
            return Err("message exceeds size cap".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

/// Dials `addr`, writes one framed message and half-closes. A failed
/// dial is reported so the caller can log and move on; there is no
/// retry queue.
pub async fn send(addr: &str, command: &str, payload: &[u8]) -> Result<(), String> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|err| format!("{addr} is not available: {err}"))?;
    stream
        .write_all(&frame(command, payload))
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VersionMsg {
    pub version: i64,
    pub best_height: i64,
    pub addr_from: String,
}

impl VersionMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.version);
        encoder.write_i64_le(self.best_height);
        encoder.write_var_str(&self.addr_from);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_i64_le()?;
        let best_height = decoder.read_i64_le()?;
        let addr_from = decoder.read_var_str()?;
        decoder.finish()?;
        Ok(Self {
            version,
            best_height,
            addr_from,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetBlocksMsg {
    pub addr_from: String,
}

impl GetBlocksMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.addr_from);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let addr_from = decoder.read_var_str()?;
        decoder.finish()?;
        Ok(Self { addr_from })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvMsg {
    pub addr_from: String,
    pub kind: String,
    pub items: Vec<Hash256>,
}

impl InvMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.addr_from);
        encoder.write_var_str(&self.kind);
        encoder.write_varint(self.items.len() as u64);
        for item in &self.items {
            encoder.write_bytes(item);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let addr_from = decoder.read_var_str()?;
        let kind = decoder.read_var_str()?;
        let count = decoder.read_varint()?;
        let mut items = Vec::with_capacity(count.min(4096) as usize);
        for _ in 0..count {
            items.push(decoder.read_fixed::<32>()?);
        }
        decoder.finish()?;
        Ok(Self {
            addr_from,
            kind,
            items,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GetDataMsg {
    pub addr_from: String,
    pub kind: String,
    pub id: Vec<u8>,
}

impl GetDataMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.addr_from);
        encoder.write_var_str(&self.kind);
        encoder.write_var_bytes(&self.id);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let addr_from = decoder.read_var_str()?;
        let kind = decoder.read_var_str()?;
        let id = decoder.read_var_bytes()?;
        decoder.finish()?;
        Ok(Self {
            addr_from,
            kind,
            id,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockMsg {
    pub addr_from: String,
    pub block: Vec<u8>,
}

impl BlockMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.addr_from);
        encoder.write_var_bytes(&self.block);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let addr_from = decoder.read_var_str()?;
        let block = decoder.read_var_bytes()?;
        decoder.finish()?;
        Ok(Self { addr_from, block })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxMsg {
    pub addr_from: String,
    pub tx: Vec<u8>,
}

impl TxMsg {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_str(&self.addr_from);
        encoder.write_var_bytes(&self.tx);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let addr_from = decoder.read_var_str()?;
        let tx = decoder.read_var_bytes()?;
        decoder.finish()?;
        Ok(Self { addr_from, tx })
    }
}
