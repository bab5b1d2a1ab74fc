use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use minibit_chain::{Chain, UtxoSet};
use minibit_primitives::validate_address;
use minibit_storage::fjall::FjallStore;

use minibit_node::rpc::{
    self, GetBalanceRequest, GetBalanceResponse, SendRequest, CMD_GET_BALANCE, CMD_SEND_TX,
};
use minibit_node::server::Node;
use minibit_node::wallet::Wallets;

const DEFAULT_PORT: u16 = 3000;

fn usage() -> &'static str {
    "Usage:\n  \
     startnode -port PORT [-miner ADDRESS]   start a node, optionally mining\n  \
     createwallet -port PORT                 generate a key pair and print its address\n  \
     getbalance -address ADDRESS -port PORT  query a running node for a balance\n  \
     send -from FROM -to TO -amount N -port PORT  submit a transfer to a running node\n  \
     reindexutxo -port PORT                  rebuild the UTXO set from the local chain"
}

fn db_file(port: u16) -> String {
    format!("blockchain_{port}.db")
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        return Err(usage().to_string());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "startnode" => start_node(&rest).await,
        "createwallet" => create_wallet(&rest),
        "getbalance" => get_balance(&rest).await,
        "send" => send(&rest).await,
        "reindexutxo" => reindex_utxo(&rest),
        _ => Err(format!("unknown command '{command}'\n{}", usage())),
    }
}

struct FlagParser<'a> {
    args: std::slice::Iter<'a, String>,
}

impl<'a> FlagParser<'a> {
    fn new(args: &'a [String]) -> Self {
        Self { args: args.iter() }
    }

    fn next_flag(&mut self) -> Option<&'a str> {
        self.args.next().map(String::as_str)
    }

    fn value(&mut self, flag: &str) -> Result<&'a str, String> {
        self.args
            .next()
            .map(String::as_str)
            .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
    }
}

fn parse_port(value: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| format!("invalid port '{value}'\n{}", usage()))
}

async fn start_node(args: &[String]) -> Result<(), String> {
    let mut port = DEFAULT_PORT;
    let mut miner_address: Option<String> = None;
    let mut parser = FlagParser::new(args);
    while let Some(flag) = parser.next_flag() {
        match flag {
            "-port" => port = parse_port(parser.value("-port")?)?,
            "-miner" => miner_address = Some(parser.value("-miner")?.to_string()),
            other => return Err(format!("unknown flag '{other}'\n{}", usage())),
        }
    }
    if let Some(address) = &miner_address {
        if !validate_address(address) {
            return Err(format!("invalid miner address '{address}'"));
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(FjallStore::open(db_file(port)).map_err(|err| err.to_string())?);
    let chain = Arc::new(Chain::open(store).map_err(|err| err.to_string())?);
    info!(height = chain.best_height(), "chain opened");

    let node = Arc::new(Node::new(port, chain, miner_address));
    tokio::select! {
        result = Arc::clone(&node).run() => result,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|err| err.to_string())?;
            node.request_shutdown();
            info!("shutting down");
            Ok(())
        }
    }
}

fn create_wallet(args: &[String]) -> Result<(), String> {
    let mut port = DEFAULT_PORT;
    let mut parser = FlagParser::new(args);
    while let Some(flag) = parser.next_flag() {
        match flag {
            "-port" => port = parse_port(parser.value("-port")?)?,
            other => return Err(format!("unknown flag '{other}'\n{}", usage())),
        }
    }

    let mut wallets = Wallets::load(port).map_err(|err| err.to_string())?;
    let address = wallets.create();
    wallets.save(port).map_err(|err| err.to_string())?;
    println!("Your new address: {address}");
    Ok(())
}

async fn get_balance(args: &[String]) -> Result<(), String> {
    let mut port = DEFAULT_PORT;
    let mut address: Option<String> = None;
    let mut parser = FlagParser::new(args);
    while let Some(flag) = parser.next_flag() {
        match flag {
            "-port" => port = parse_port(parser.value("-port")?)?,
            "-address" => address = Some(parser.value("-address")?.to_string()),
            other => return Err(format!("unknown flag '{other}'\n{}", usage())),
        }
    }
    let Some(address) = address else {
        return Err(format!("getbalance requires -address\n{}", usage()));
    };

    let payload = GetBalanceRequest {
        address: address.clone(),
    }
    .encode();
    let response = rpc::call(port, CMD_GET_BALANCE, payload).await?;
    if !response.success {
        return Err(format!("getbalance failed: {}", response.message));
    }
    let balance = GetBalanceResponse::decode(&response.data)
        .map_err(|err| format!("malformed balance response: {err}"))?;
    println!(
        "Balance of '{address}' (via node on port {port}): {}",
        balance.balance
    );
    Ok(())
}

async fn send(args: &[String]) -> Result<(), String> {
    let mut port = DEFAULT_PORT;
    let mut from: Option<String> = None;
    let mut to: Option<String> = None;
    let mut amount: Option<i64> = None;
    let mut parser = FlagParser::new(args);
    while let Some(flag) = parser.next_flag() {
        match flag {
            "-port" => port = parse_port(parser.value("-port")?)?,
            "-from" => from = Some(parser.value("-from")?.to_string()),
            "-to" => to = Some(parser.value("-to")?.to_string()),
            "-amount" => {
                let value = parser.value("-amount")?;
                amount = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| format!("invalid amount '{value}'\n{}", usage()))?,
                );
            }
            other => return Err(format!("unknown flag '{other}'\n{}", usage())),
        }
    }
    let (Some(from), Some(to), Some(amount)) = (from, to, amount) else {
        return Err(format!("send requires -from, -to and -amount\n{}", usage()));
    };
    if amount <= 0 {
        return Err("amount must be positive".to_string());
    }
    // The node re-validates; this only saves a round trip.
    if !validate_address(&from) || !validate_address(&to) {
        return Err("addresses are not valid".to_string());
    }

    let payload = SendRequest {
        from,
        to,
        amount,
    }
    .encode();
    let response = rpc::call(port, CMD_SEND_TX, payload).await?;
    if !response.success {
        return Err(format!("send failed: {}", response.message));
    }
    println!("Transaction {} submitted to mempool", response.message);
    Ok(())
}

fn reindex_utxo(args: &[String]) -> Result<(), String> {
    let mut port = DEFAULT_PORT;
    let mut parser = FlagParser::new(args);
    while let Some(flag) = parser.next_flag() {
        match flag {
            "-port" => port = parse_port(parser.value("-port")?)?,
            other => return Err(format!("unknown flag '{other}'\n{}", usage())),
        }
    }

    let store = Arc::new(FjallStore::open(db_file(port)).map_err(|err| err.to_string())?);
    let chain = Chain::open(store).map_err(|err| err.to_string())?;
    let utxo = UtxoSet::new(&chain);
    utxo.reindex().map_err(|err| err.to_string())?;
    println!("Done! The UTXO set has been rebuilt.");
    Ok(())
}
