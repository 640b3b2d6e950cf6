use crate::core::ProducerConfig;
use crate::error::{BlockchainError, Result};
use crate::wallet::KeyPair;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2001;
pub const DEFAULT_DATA_DIR: &str = "data/aurum";
pub const DEFAULT_BLOCK_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_SYNC_RETRY_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_TX_POOL_CAPACITY: usize = 10_000;

/// Node settings, filled in by the binary and handed to each component.
///
/// Nothing in the library reads the process environment; the CLI does that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WIF private key of the local minter, if this node produces blocks
    pub minter_wif: Option<String>,
    /// Disables the block timer; blocks are produced on demand
    pub regtest: bool,
    pub bind_address: String,
    pub port: u16,
    /// Upstream `host:port` addresses, in failover order
    pub peers: Vec<String>,
    pub data_dir: PathBuf,
    pub block_interval: Duration,
    pub missed_block_delay: Duration,
    pub sync_retry_delay: Duration,
    pub tx_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            minter_wif: None,
            regtest: false,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            peers: vec![],
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            block_interval: DEFAULT_BLOCK_INTERVAL,
            missed_block_delay: DEFAULT_BLOCK_INTERVAL / 2,
            sync_retry_delay: DEFAULT_SYNC_RETRY_DELAY,
            tx_pool_capacity: DEFAULT_TX_POOL_CAPACITY,
        }
    }
}

impl Config {
    /// Sets the block interval and keeps the missed-block delay at half of it
    pub fn with_block_interval(mut self, interval: Duration) -> Config {
        self.block_interval = interval;
        self.missed_block_delay = interval / 2;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_interval.as_secs() == 0 {
            return Err(BlockchainError::Config(
                "block interval must be at least one second".to_string(),
            ));
        }
        if self.missed_block_delay.is_zero() {
            return Err(BlockchainError::Config(
                "missed block delay must be positive".to_string(),
            ));
        }
        if self.tx_pool_capacity == 0 {
            return Err(BlockchainError::Config(
                "transaction pool capacity must be positive".to_string(),
            ));
        }
        self.minter_key()?;
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Decoded minter key; an unparsable WIF is a configuration error
    pub fn minter_key(&self) -> Result<Option<KeyPair>> {
        match &self.minter_wif {
            Some(wif) => KeyPair::from_wif(wif)
                .map(Some)
                .map_err(|e| BlockchainError::Config(format!("invalid minter key: {e}"))),
            None => Ok(None),
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            block_interval: self.block_interval,
            missed_block_delay: self.missed_block_delay,
            regtest: self.regtest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.listen_address(), "127.0.0.1:2001");
        assert_eq!(config.producer_config().missed_block_delay, Duration::from_millis(1500));
    }

    #[test]
    fn test_rejects_zero_interval_and_bad_key() {
        let config = Config::default().with_block_interval(Duration::ZERO);
        assert!(matches!(config.validate(), Err(BlockchainError::Config(_))));

        let config = Config {
            minter_wif: Some("not a key".to_string()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(BlockchainError::Config(_))));
    }

    #[test]
    fn test_minter_key_round_trip() {
        let key = KeyPair::generate().unwrap();
        let config = Config {
            minter_wif: Some(key.private_key().to_wif()),
            regtest: true,
            ..Config::default()
        };
        let decoded = config.minter_key().unwrap().unwrap();
        assert_eq!(decoded.public_key(), key.public_key());
        assert!(config.producer_config().regtest);
    }
}
