//! Node configuration
//!
//! Plain values handed to each component at construction time.

pub mod settings;

pub use settings::{
    Config, DEFAULT_BIND_ADDRESS, DEFAULT_BLOCK_INTERVAL, DEFAULT_DATA_DIR, DEFAULT_PORT,
    DEFAULT_SYNC_RETRY_DELAY, DEFAULT_TX_POOL_CAPACITY,
};
