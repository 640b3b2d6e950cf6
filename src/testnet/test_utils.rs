//! Test utilities for ledger, pool and network tests

use crate::core::{Asset, Block, Blockchain, SignedBlock, SkipFlags, Transaction};
use crate::utils::current_timestamp;
use crate::wallet::{KeyPair, PublicKey};
use std::sync::Arc;
use tempfile::TempDir;

/// Genesis is stamped this far in the past so tests can append blocks one second apart
/// without running ahead of the clock
pub const GENESIS_AGE_SECS: u64 = 30;

/// A chain with a genesis block in its own temporary directory
pub struct TestChain {
    pub chain: Arc<Blockchain>,
    pub minter: KeyPair,
    pub staker: KeyPair,
    pub genesis_time: u64,
    pub dir: TempDir,
}

pub fn asset(text: &str) -> Asset {
    text.parse().unwrap()
}

pub fn now() -> u64 {
    current_timestamp().unwrap()
}

/// Opens a fresh chain and mints a genesis paying `reward` to a new staker
pub async fn genesis_chain(reward: &str) -> TestChain {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(Blockchain::open(dir.path()).unwrap());
    let minter = KeyPair::generate().unwrap();
    let staker = KeyPair::generate().unwrap();
    let genesis_time = now() - GENESIS_AGE_SECS;
    chain
        .create_genesis_block(&minter, &staker, vec![asset(reward)], genesis_time)
        .await
        .unwrap();
    TestChain {
        chain,
        minter,
        staker,
        genesis_time,
        dir,
    }
}

/// Opens an empty chain, used as the lagging side of sync tests
pub fn empty_chain() -> (Arc<Blockchain>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let chain = Arc::new(Blockchain::open(dir.path()).unwrap());
    (chain, dir)
}

pub fn signed_transfer(
    from: &KeyPair,
    to: &PublicKey,
    amount: &str,
    fee: &str,
    timestamp: u64,
) -> Transaction {
    let mut tx = Transaction::new_transfer(
        *from.public_key(),
        *to,
        asset(amount),
        asset(fee),
        None,
        timestamp,
    );
    tx.sign(from).unwrap();
    tx
}

/// Signs a block on top of the current head without adding it
pub async fn next_block(
    chain: &Blockchain,
    minter: &KeyPair,
    transactions: Vec<Transaction>,
    timestamp: u64,
) -> SignedBlock {
    let head = chain.get_chain_head().await.unwrap();
    Block::new(head.get_height() + 1, head.hash(), timestamp, transactions)
        .sign(minter)
        .unwrap()
}

/// Appends `count` empty blocks one second apart
pub async fn extend_chain(test: &TestChain, count: u64) {
    extend_chain_with(test, count, SkipFlags::NONE).await
}

/// Like `extend_chain`; pass `SKIP_TIME` to grow past the current clock
pub async fn extend_chain_with(test: &TestChain, count: u64, skip: SkipFlags) {
    for _ in 0..count {
        let head = test.chain.get_chain_head().await.unwrap();
        let block = next_block(&test.chain, &test.minter, vec![], head.get_timestamp() + 1).await;
        test.chain.add_block_with_flags(block, skip).await.unwrap();
    }
}
