//! Core ledger functionality
//!
//! Assets, transactions, blocks, the blockchain engine that applies them, the fee
//! schedule, the round-robin minter scheduler and the block producer.

pub mod asset;
pub mod block;
pub mod blockchain;
pub mod bond;
pub mod fees;
pub mod producer;
pub mod scheduler;
pub mod transaction;

pub use asset::{Asset, AssetSymbol, Balance, MAX_ASSET_AMOUNT_LEN, MAX_PRECISION};
pub use block::{Block, SignedBlock, SkipFlags, HASH_LEN};
pub use blockchain::{balance_deltas, Blockchain, TX_EXPIRY_SECS, TX_MAX_FUTURE_SECS};
pub use bond::Bond;
pub use fees::{FixedFeeCalculator, FEE_PRECISION};
pub use producer::{Producer, ProducerConfig};
pub use scheduler::Scheduler;
pub use transaction::{BondTx, RewardTx, Transaction, TransferTx, TxBase, TxType, MAX_MEMO_BYTES};
