use crate::config::{
    Config, DEFAULT_BIND_ADDRESS, DEFAULT_DATA_DIR, DEFAULT_PORT, DEFAULT_TX_POOL_CAPACITY,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "aurum-chain", version, about = "Proof-of-stake ledger node")]
pub struct Opt {
    #[arg(
        long,
        global = true,
        env = "AURUM_HOME",
        default_value = DEFAULT_DATA_DIR,
        help = "Directory holding the block log and index"
    )]
    pub data_dir: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "keygen", about = "Generate a key pair and print it as JSON")]
    Keygen,
    #[command(name = "genesis", about = "Write the genesis block into an empty data directory")]
    Genesis {
        #[arg(long, help = "WIF private key of the first minter")]
        minter_wif: String,
        #[arg(long, help = "WIF private key of the staker receiving the rewards")]
        staker_wif: String,
        #[arg(
            long = "reward",
            default_value = "1 GOLD",
            help = "Initial reward to the staker, e.g. '100 GOLD'; repeatable"
        )]
        rewards: Vec<String>,
    },
    #[command(name = "getbalance", about = "Print the committed balance of an address")]
    GetBalance {
        #[arg(help = "The account address")]
        address: String,
    },
    #[command(name = "printchain", about = "Print all blocks in the chain")]
    Printchain,
    #[command(name = "node", about = "Run a node")]
    Node(NodeArgs),
}

#[derive(Args, Debug)]
pub struct NodeArgs {
    #[arg(long, env = "AURUM_MINTER_WIF", help = "WIF private key to mint blocks with")]
    pub minter_wif: Option<String>,
    #[arg(long, env = "AURUM_REGTEST", help = "Disable the block production timer")]
    pub regtest: bool,
    #[arg(long = "bind", env = "AURUM_BIND", default_value = DEFAULT_BIND_ADDRESS)]
    pub bind_address: String,
    #[arg(long, env = "AURUM_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    #[arg(
        long,
        env = "AURUM_PEERS",
        value_delimiter = ',',
        help = "Upstream peers as host:port, in failover order"
    )]
    pub peers: Vec<String>,
    #[arg(long, default_value_t = 3, help = "Seconds between blocks")]
    pub block_interval: u64,
    #[arg(long, default_value_t = 3, help = "Seconds to wait before retrying a sync")]
    pub sync_retry_delay: u64,
    #[arg(long, default_value_t = DEFAULT_TX_POOL_CAPACITY)]
    pub tx_pool_capacity: usize,
}

impl NodeArgs {
    pub fn into_config(self, data_dir: PathBuf) -> Config {
        Config {
            minter_wif: self.minter_wif,
            regtest: self.regtest,
            bind_address: self.bind_address,
            port: self.port,
            peers: self.peers,
            data_dir,
            sync_retry_delay: Duration::from_secs(self.sync_retry_delay),
            tx_pool_capacity: self.tx_pool_capacity,
            ..Config::default()
        }
        .with_block_interval(Duration::from_secs(self.block_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_args_into_config() {
        let opt = Opt::parse_from([
            "aurum-chain",
            "--data-dir",
            "/tmp/aurum-test",
            "node",
            "--regtest",
            "--port",
            "2100",
            "--peers",
            "127.0.0.1:2001,127.0.0.1:2002",
            "--block-interval",
            "4",
        ]);
        let config = match opt.command {
            Command::Node(args) => args.into_config(opt.data_dir),
            other => panic!("unexpected {other:?}"),
        };
        assert!(config.regtest);
        assert_eq!(config.listen_address(), "127.0.0.1:2100");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.missed_block_delay, Duration::from_secs(2));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/aurum-test"));
    }

    #[test]
    fn test_genesis_rewards_repeat() {
        let opt = Opt::parse_from([
            "aurum-chain",
            "genesis",
            "--minter-wif",
            "m",
            "--staker-wif",
            "s",
            "--reward",
            "10 GOLD",
            "--reward",
            "5 SILVER",
        ]);
        match opt.command {
            Command::Genesis { rewards, .. } => assert_eq!(rewards, vec!["10 GOLD", "5 SILVER"]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
