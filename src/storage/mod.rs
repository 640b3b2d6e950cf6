//! Data storage and persistence
//!
//! The append-only block log, the sled-backed ledger index with its write batch, and the
//! pool of transactions waiting to be minted.

pub mod chain_store;
pub mod indexer;
pub mod tx_pool;

pub use chain_store::ChainStore;
pub use indexer::{IndexBatch, Indexer};
pub use tx_pool::TxPool;
