//! # Aurum Chain
//!
//! A small proof-of-stake ledger node with two native assets, GOLD and SILVER.
//!
//! ## Layout
//! - `core/`: assets, transactions, blocks, the ledger, minter scheduling and block production
//! - `wallet/`: ed25519 key pairs and their checksummed WIF text form
//! - `storage/`: append-only block log, sled-backed index and the transaction pool
//! - `network/`: peer RPC, transports, failover client pool and chain synchronization
//! - `config/`: node settings
//! - `utils/`: hashing, key primitives, clocks and the consensus codec
//! - `cli/`: command-line arguments for the binary
//!
//! Minting authority comes from bonds. Bonded minters take turns in public key order and a
//! minter that misses its slot is skipped, so every node agrees on whose turn it is from
//! the chain alone.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub mod testnet;

// Re-export commonly used types for convenience
pub use cli::{Command, NodeArgs, Opt};
pub use config::Config;
pub use core::{
    Asset, AssetSymbol, Balance, Block, Blockchain, Bond, FixedFeeCalculator, Producer,
    ProducerConfig, Scheduler, SignedBlock, SkipFlags, Transaction, TxType,
};
pub use error::{BlockchainError, Result};
pub use network::{
    BalanceInfo, ClientPeer, ClientPeerPool, LoopbackTransport, Peer, RpcServer, Synchronizer,
    TcpTransport,
};
pub use storage::{ChainStore, Indexer, TxPool};
pub use utils::{base58_decode, base58_encode, current_timestamp, double_sha256, sha256_digest};
pub use wallet::{KeyPair, PrivateKey, PublicKey, SigPair};
