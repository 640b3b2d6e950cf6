// Entry point for the aurum-chain binary.
// Every subcommand opens the chain stored under --data-dir; `node` additionally wires the
// pool, producer, RPC server and synchronizer together and runs until ctrl-c.

use aurum_chain::network::{self, ClientPeer, ClientPeerPool, Peer, RpcServer, TcpTransport};
use aurum_chain::{
    current_timestamp, Asset, BalanceInfo, Blockchain, Command, Config, KeyPair, NodeArgs, Opt,
    Producer, PublicKey, Synchronizer, TxPool,
};
use clap::Parser;
use log::{error, info, LevelFilter};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();
    if let Err(e) = run_command(opt).await {
        error!("Error: {e}");
        process::exit(1);
    }
}

async fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    match opt.command {
        Command::Keygen => {
            let key = KeyPair::generate()?;
            let out = json!({
                "private_wif": key.private_key().to_wif(),
                "address": key.public_key().to_wif(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Genesis {
            minter_wif,
            staker_wif,
            rewards,
        } => {
            let minter = KeyPair::from_wif(&minter_wif)?;
            let staker = KeyPair::from_wif(&staker_wif)?;
            let rewards = rewards
                .iter()
                .map(|r| r.parse::<Asset>())
                .collect::<Result<Vec<_>, _>>()?;

            let chain = Blockchain::open(&opt.data_dir)?;
            let genesis = chain
                .create_genesis_block(&minter, &staker, rewards, current_timestamp()?)
                .await?;
            chain.flush()?;
            let out = json!({
                "height": genesis.get_height(),
                "hash": genesis.hash_hex(),
                "minter": minter.public_key().to_wif(),
                "staker": staker.public_key().to_wif(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::GetBalance { address } => {
            let key = PublicKey::from_wif(&address)?;
            let chain = Blockchain::open(&opt.data_dir)?;
            let balance = chain.get_balance(&key, &[])?;
            println!("{}", serde_json::to_string_pretty(&BalanceInfo::from(&balance))?);
        }
        Command::Printchain => {
            let chain = Blockchain::open(&opt.data_dir)?;
            let height = match chain.get_chain_height().await {
                Some(height) => height,
                None => {
                    println!("Chain is empty");
                    return Ok(());
                }
            };
            for block in chain.get_block_range(0, height).await? {
                println!("Height: {}", block.get_height());
                println!("Hash: {}", block.hash_hex());
                println!("Timestamp: {}", block.get_timestamp());
                println!("Signer: {}", block.signing_key());
                for tx in block.get_transactions() {
                    println!("- {:?} {} (fee {})", tx.tx_type(), tx.hash_hex(), tx.fee());
                }
                println!();
            }
        }
        Command::Node(args) => run_node(args, opt.data_dir).await?,
    }
    Ok(())
}

async fn run_node(args: NodeArgs, data_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config: Config = args.into_config(data_dir);
    config.validate()?;

    let chain = Arc::new(Blockchain::open(&config.data_dir)?);
    let pool = Arc::new(TxPool::new(chain.clone(), config.tx_pool_capacity));
    let producer = Arc::new(Producer::new(
        chain.clone(),
        pool.clone(),
        config.minter_key()?,
        config.producer_config(),
    ));

    let server = Arc::new(RpcServer::new(
        chain.clone(),
        pool.clone(),
        config.block_interval,
    ));
    server.start().await;
    let accept = network::listen(server.clone(), &config.listen_address()).await?;

    let peers: Vec<Arc<dyn Peer>> = config
        .peers
        .iter()
        .map(|addr| {
            Arc::new(ClientPeer::new(Arc::new(TcpTransport::new(addr.clone())))) as Arc<dyn Peer>
        })
        .collect();
    let upstream = Arc::new(ClientPeerPool::new(peers, config.sync_retry_delay));
    let synchronizer = Arc::new(Synchronizer::new(
        chain.clone(),
        pool,
        producer.clone(),
        upstream,
        config.sync_retry_delay,
    ));
    synchronizer.start().await?;
    info!(
        "Node running at height {:?}, press ctrl-c to stop",
        chain.get_chain_height().await
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    synchronizer.stop().await;
    producer.stop().await;
    server.stop().await;
    accept.abort();
    chain.flush()?;
    Ok(())
}
