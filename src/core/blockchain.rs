// This is the ledger engine: it owns the head of the chain, the block log and the index.
// Every block goes through the same path: I validate it against the head, stage its ledger
// deltas in an IndexBatch, append it to the log and only then commit the batch and move
// the head. Readers never see a block whose balances are not indexed yet.

use crate::core::{
    Asset, AssetSymbol, Balance, Block, Bond, FixedFeeCalculator, Scheduler, SignedBlock,
    SkipFlags, Transaction,
};
use crate::error::{BlockchainError, Result};
use crate::storage::{ChainStore, IndexBatch, Indexer};
use crate::utils::{current_timestamp, Encode};
use crate::wallet::{KeyPair, PublicKey};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex};

/// A transaction expires this many seconds after its timestamp
pub const TX_EXPIRY_SECS: u64 = 60;
/// How far ahead of the local clock a block or transaction may be stamped
pub const TX_MAX_FUTURE_SECS: u64 = 3;

const BLOCK_LOG_FILE: &str = "blocklog";
const INDEX_DIR: &str = "index";
const BLOCK_EVENT_CAPACITY: usize = 1024;

// Everything add_block reads and then writes lives behind one lock
struct ChainState {
    store: ChainStore,
    head: Option<SignedBlock>,
    scheduler: Scheduler,
}

pub struct Blockchain {
    state: Mutex<ChainState>,
    indexer: Indexer,
    fees: FixedFeeCalculator,
    events: broadcast::Sender<SignedBlock>,
    data_dir: PathBuf,
}

/// Signed per-account effect of a transaction; debits are negative
pub fn balance_deltas(tx: &Transaction) -> Result<Vec<(PublicKey, Asset)>> {
    Ok(match tx {
        Transaction::Reward(reward) => reward
            .rewards
            .iter()
            .map(|asset| (reward.to, asset.clone()))
            .collect(),
        Transaction::Transfer(transfer) => vec![
            (transfer.from, transfer.amount.add(&transfer.base.fee)?.neg()),
            (transfer.to, transfer.amount.clone()),
        ],
        Transaction::Bond(bond) => vec![(bond.staker, bond.base.fee.add(&bond.bond_fee)?.neg())],
    })
}

// Rewards mint new tokens, every fee paid is burned
fn supply_deltas(tx: &Transaction) -> Result<Vec<Asset>> {
    Ok(match tx {
        Transaction::Reward(reward) => reward.rewards.clone(),
        Transaction::Transfer(transfer) => vec![transfer.base.fee.neg()],
        Transaction::Bond(bond) => vec![bond.base.fee.add(&bond.bond_fee)?.neg()],
    })
}

impl Blockchain {
    /// Opens (or creates) the block log and index under `data_dir` and loads the head
    pub fn open(data_dir: &Path) -> Result<Blockchain> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            BlockchainError::Io(format!(
                "Failed to create data directory {}: {e}",
                data_dir.display()
            ))
        })?;
        let mut store = ChainStore::open(&data_dir.join(BLOCK_LOG_FILE))?;
        let indexer = Indexer::open(&data_dir.join(INDEX_DIR))?;

        let head = Self::load_head(&mut store, &indexer)?;
        let scheduler = Scheduler::new(indexer.get_bonds()?);
        match &head {
            Some(block) => info!(
                "Loaded chain at height {} ({}) with {} bond(s)",
                block.get_height(),
                block.hash_hex(),
                scheduler.len()
            ),
            None => info!("Opened empty chain at {}", data_dir.display()),
        }

        let (events, _) = broadcast::channel(BLOCK_EVENT_CAPACITY);
        Ok(Blockchain {
            state: Mutex::new(ChainState {
                store,
                head,
                scheduler,
            }),
            indexer,
            fees: FixedFeeCalculator::default(),
            events,
            data_dir: data_dir.to_path_buf(),
        })
    }

    fn load_head(store: &mut ChainStore, indexer: &Indexer) -> Result<Option<SignedBlock>> {
        let height = match indexer.get_chain_height()? {
            Some(height) => height,
            None => return Ok(None),
        };
        let offset = indexer.get_block_pos(height)?.ok_or_else(|| {
            BlockchainError::CorruptStore(format!("no log position for head height {height}"))
        })?;
        Ok(Some(store.read(offset)?))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn fee_calculator(&self) -> &FixedFeeCalculator {
        &self.fees
    }

    /// Notified with every block appended through `add_block`
    pub fn subscribe(&self) -> broadcast::Receiver<SignedBlock> {
        self.events.subscribe()
    }

    // Genesis pays `rewards` to the staker and bonds the minter, staking all of its GOLD
    pub async fn create_genesis_block(
        &self,
        minter: &KeyPair,
        staker: &KeyPair,
        rewards: Vec<Asset>,
        timestamp: u64,
    ) -> Result<SignedBlock> {
        if self.get_chain_head().await.is_some() {
            return Err(BlockchainError::validation("chain already has a genesis block"));
        }
        let mut stake = Asset::zero(AssetSymbol::Gold);
        for reward in rewards.iter().filter(|r| r.symbol() == AssetSymbol::Gold) {
            stake = stake.add(reward)?;
        }

        let reward = Transaction::new_reward(*staker.public_key(), rewards, timestamp);
        let mut bond = Transaction::new_bond(
            *minter.public_key(),
            *staker.public_key(),
            stake,
            Asset::zero(AssetSymbol::Gold),
            Asset::zero(AssetSymbol::Gold),
            timestamp,
        );
        bond.sign(minter)?;
        bond.sign(staker)?;

        let genesis = Block::new(0, [0u8; 32], timestamp, vec![reward, bond]).sign(minter)?;
        self.add_block(genesis.clone()).await?;
        info!("Created genesis block {}", genesis.hash_hex());
        Ok(genesis)
    }

    pub async fn add_block(&self, block: SignedBlock) -> Result<()> {
        self.add_block_with_flags(block, SkipFlags::NONE).await
    }

    pub async fn add_block_with_flags(&self, block: SignedBlock, skip: SkipFlags) -> Result<()> {
        let mut state = self.state.lock().await;
        let ChainState {
            store,
            head,
            scheduler,
        } = &mut *state;

        let (batch, staged_scheduler) =
            self.stage_block(store, head.as_ref(), scheduler, &IndexBatch::new(), &block, skip)?;
        self.indexer.write_batch(&batch)?;
        *scheduler = staged_scheduler;
        *head = Some(block.clone());
        drop(state);

        info!(
            "Added block {} at height {} ({} tx)",
            block.hash_hex(),
            block.get_height(),
            block.get_transactions().len()
        );
        // No subscribers is fine
        let _ = self.events.send(block);
        Ok(())
    }

    /// Applies a run of consecutive blocks with a single index commit.
    ///
    /// Blocks that applied before a failure are still committed; the error of the first
    /// failing block is returned afterwards.
    pub async fn index_blocks(&self, blocks: Vec<SignedBlock>, skip: SkipFlags) -> Result<usize> {
        let mut state = self.state.lock().await;
        let ChainState {
            store,
            head,
            scheduler,
        } = &mut *state;

        let mut batch = IndexBatch::new();
        let mut working_head = head.clone();
        let mut working_scheduler = scheduler.clone();
        let mut applied = 0;
        let mut failure = None;

        for block in blocks {
            match self.stage_block(
                store,
                working_head.as_ref(),
                &working_scheduler,
                &batch,
                &block,
                skip,
            ) {
                Ok((staged, staged_scheduler)) => {
                    batch = staged;
                    working_scheduler = staged_scheduler;
                    working_head = Some(block);
                    applied += 1;
                }
                Err(e) => {
                    warn!("Stopped indexing at height {}: {e}", block.get_height());
                    failure = Some(e);
                    break;
                }
            }
        }

        self.indexer.write_batch(&batch)?;
        *head = working_head;
        *scheduler = working_scheduler;
        if applied > 0 {
            debug!("Indexed {applied} block(s), head is now {:?}", batch.height());
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(applied),
        }
    }

    // Validates `block` on top of `head` and returns the batch and scheduler with its
    // effects applied. Inputs are left untouched so a failed block leaves no trace.
    fn stage_block(
        &self,
        store: &mut ChainStore,
        head: Option<&SignedBlock>,
        scheduler: &Scheduler,
        batch: &IndexBatch,
        block: &SignedBlock,
        skip: SkipFlags,
    ) -> Result<(IndexBatch, Scheduler)> {
        self.check_block(head, scheduler, block, skip)?;

        let mut staged = batch.clone();
        let mut staged_scheduler = scheduler.clone();
        for tx in block.get_transactions() {
            self.check_not_replayed(&staged, tx, block.get_timestamp())?;
            self.apply_transaction(&mut staged, &mut staged_scheduler, tx)?;
        }

        let offset = store.append(block)?;
        staged.add_block_pos(block.get_height(), offset);
        staged.set_chain_height(block.get_height());
        Ok((staged, staged_scheduler))
    }

    fn check_block(
        &self,
        head: Option<&SignedBlock>,
        scheduler: &Scheduler,
        block: &SignedBlock,
        skip: SkipFlags,
    ) -> Result<()> {
        block.validate(head, skip)?;
        let height = block.get_height();

        // Genesis establishes the first bond, so there is nobody to check it against yet
        if height > 0
            && !skip.contains(SkipFlags::SKIP_BOND_SIGNER)
            && !scheduler.is_bonded(block.signing_key())
        {
            return Err(BlockchainError::InvalidSigner(format!(
                "{} is not a bonded minter",
                block.signing_key()
            )));
        }

        if !skip.contains(SkipFlags::SKIP_TIME) {
            self.check_block_time(head, block)?;
        }

        if height > 0 {
            if !skip.contains(SkipFlags::SKIP_TX) {
                for tx in block.get_transactions() {
                    self.fees.validate_fee(tx)?;
                }
            }
            self.check_rewards(block)?;
        }
        Ok(())
    }

    fn check_block_time(&self, head: Option<&SignedBlock>, block: &SignedBlock) -> Result<()> {
        let timestamp = block.get_timestamp();
        let now = current_timestamp()?;
        if timestamp > now + TX_MAX_FUTURE_SECS {
            return Err(BlockchainError::validation(format!(
                "block {} is stamped {}s in the future",
                block.get_height(),
                timestamp - now
            )));
        }
        if let Some(prev) = head {
            if timestamp <= prev.get_timestamp() {
                return Err(BlockchainError::validation(format!(
                    "block {} is not after its predecessor",
                    block.get_height()
                )));
            }
        }
        for tx in block.get_transactions() {
            self.check_tx_window(tx, timestamp)?;
        }
        Ok(())
    }

    fn check_tx_window(&self, tx: &Transaction, block_time: u64) -> Result<()> {
        if tx.timestamp() > block_time + TX_MAX_FUTURE_SECS
            || tx.timestamp() + TX_EXPIRY_SECS <= block_time
        {
            return Err(BlockchainError::validation(format!(
                "transaction {} is outside its time window",
                tx.hash_hex()
            )));
        }
        Ok(())
    }

    // Rewards after genesis can only redistribute the fees collected in the same block
    fn check_rewards(&self, block: &SignedBlock) -> Result<()> {
        let (fee_gold, fee_silver) = self.fees.collected_fees(block.get_transactions())?;
        let mut rewards = Balance::default();
        for tx in block.get_transactions() {
            if let Transaction::Reward(reward) = tx {
                for asset in &reward.rewards {
                    rewards.add(asset)?;
                }
            }
        }
        if rewards.gold.gt(&fee_gold)? || rewards.silver.gt(&fee_silver)? {
            return Err(BlockchainError::validation(format!(
                "block {} rewards {rewards} exceed collected fees ({fee_gold}, {fee_silver})",
                block.get_height()
            )));
        }
        Ok(())
    }

    // A signed transaction is consumed once: not twice in a block, not again in a later one
    fn check_not_replayed(&self, batch: &IndexBatch, tx: &Transaction, now: u64) -> Result<()> {
        if let Transaction::Reward(_) = tx {
            return Ok(());
        }
        let tx_bytes = tx.to_bytes();
        if batch.has_tx(&tx_bytes) || self.indexer.has_applied_tx(&tx_bytes, now)? {
            debug!("Rejecting replayed transaction {}", tx.hash_hex());
            return Err(BlockchainError::DuplicateTransaction);
        }
        Ok(())
    }

    // Computes every effect first and only then writes, so a failing transaction leaves
    // `batch` and `scheduler` as they were
    fn apply_transaction(
        &self,
        batch: &mut IndexBatch,
        scheduler: &mut Scheduler,
        tx: &Transaction,
    ) -> Result<()> {
        let mut balances: Vec<(PublicKey, Balance)> = vec![];
        for (key, delta) in balance_deltas(tx)? {
            let mut balance = match balances.iter().position(|(k, _)| *k == key) {
                Some(i) => balances.remove(i).1,
                None => batch.balance(&self.indexer, &key)?,
            };
            let available = balance.get(delta.symbol()).clone();
            balance.add(&delta)?;
            if delta.is_negative() && balance.get(delta.symbol()).is_negative() {
                return Err(BlockchainError::InsufficientBalance {
                    required: delta.neg().to_string(),
                    available: available.to_string(),
                });
            }
            balances.push((key, balance));
        }

        let bond = match tx {
            Transaction::Bond(bond_tx) => {
                let gold = match balances.iter().find(|(k, _)| *k == bond_tx.staker) {
                    Some((_, balance)) => balance.gold.clone(),
                    None => batch.balance(&self.indexer, &bond_tx.staker)?.gold,
                };
                if gold.lt(&bond_tx.stake_amt)? {
                    return Err(BlockchainError::InsufficientBalance {
                        required: bond_tx.stake_amt.to_string(),
                        available: gold.to_string(),
                    });
                }
                Some(Bond::new(bond_tx.minter, bond_tx.staker, bond_tx.stake_amt.clone()))
            }
            _ => None,
        };

        let mut supply = batch.token_supply(&self.indexer)?;
        for delta in supply_deltas(tx)? {
            supply.add(&delta)?;
        }

        for (key, balance) in balances {
            batch.set_balance(key, balance);
        }
        if let Some(bond) = bond {
            scheduler.insert_bond(bond.clone());
            batch.insert_bond(bond);
        }
        batch.set_token_supply(supply);
        if !matches!(tx, Transaction::Reward(_)) {
            batch.add_tx(tx.to_bytes(), tx.timestamp() + TX_EXPIRY_SECS);
        }
        Ok(())
    }

    /// Splits pool transactions into those that still apply, in order, on top of the
    /// current head for a block stamped `timestamp`, and those that no longer do.
    /// Nothing is written.
    pub async fn select_applicable(
        &self,
        transactions: Vec<Transaction>,
        timestamp: u64,
    ) -> Result<(Vec<Transaction>, Vec<(Transaction, BlockchainError)>)> {
        let state = self.state.lock().await;
        let mut batch = IndexBatch::new();
        let mut scheduler = state.scheduler.clone();
        let mut selected = vec![];
        let mut rejected = vec![];

        for tx in transactions {
            match self.try_include(&mut batch, &mut scheduler, &tx, timestamp) {
                Ok(()) => selected.push(tx),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => rejected.push((tx, e)),
            }
        }
        Ok((selected, rejected))
    }

    fn try_include(
        &self,
        batch: &mut IndexBatch,
        scheduler: &mut Scheduler,
        tx: &Transaction,
        timestamp: u64,
    ) -> Result<()> {
        self.check_tx_window(tx, timestamp)?;
        self.fees.validate_fee(tx)?;
        self.check_not_replayed(batch, tx, timestamp)?;
        self.apply_transaction(batch, scheduler, tx)
    }

    /// Releases the pool's dedup entry for a transaction that was dropped unapplied
    pub fn forget_tx(&self, tx_bytes: &[u8]) -> Result<bool> {
        self.indexer.remove_queued_tx(tx_bytes)
    }

    /// Re-reads the head and bond set from the index
    pub async fn reload_head(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let head = Self::load_head(&mut state.store, &self.indexer)?;
        state.scheduler = Scheduler::new(self.indexer.get_bonds()?);
        state.head = head;
        Ok(())
    }

    pub async fn get_chain_head(&self) -> Option<SignedBlock> {
        self.state.lock().await.head.clone()
    }

    pub async fn get_chain_height(&self) -> Option<u64> {
        self.state
            .lock()
            .await
            .head
            .as_ref()
            .map(SignedBlock::get_height)
    }

    pub async fn get_block(&self, height: u64) -> Result<Option<SignedBlock>> {
        let mut state = self.state.lock().await;
        match self.indexer.get_block_pos(height)? {
            Some(offset) => Ok(Some(state.store.read(offset)?)),
            None => Ok(None),
        }
    }

    /// Blocks `min..=max`, stopping early at the head
    pub async fn get_block_range(&self, min: u64, max: u64) -> Result<Vec<SignedBlock>> {
        let mut state = self.state.lock().await;
        let mut blocks = vec![];
        for height in min..=max {
            match self.indexer.get_block_pos(height)? {
                Some(offset) => blocks.push(state.store.read(offset)?),
                None => break,
            }
        }
        Ok(blocks)
    }

    /// Committed balance of `key` with the effect of `pending` folded in
    pub fn get_balance(&self, key: &PublicKey, pending: &[Transaction]) -> Result<Balance> {
        let mut balance = self.indexer.get_balance(key)?.unwrap_or_default();
        for tx in pending {
            for (account, delta) in balance_deltas(tx)? {
                if account == *key {
                    balance.add(&delta)?;
                }
            }
        }
        Ok(balance)
    }

    /// Minimum fee `key` pays per transaction, quoted for both symbols
    pub fn get_total_fee(&self, key: &PublicKey) -> Result<Balance> {
        debug!("Quoting total fee for {key}");
        Balance::new(
            self.fees.total_fee(AssetSymbol::Gold)?,
            self.fees.total_fee(AssetSymbol::Silver)?,
        )
    }

    pub fn get_token_supply(&self) -> Result<Balance> {
        self.indexer.get_token_supply()
    }

    pub async fn get_bond(&self, minter: &PublicKey) -> Option<Bond> {
        self.state.lock().await.scheduler.get_bond(minter).cloned()
    }

    pub async fn get_bonds(&self) -> Vec<Bond> {
        self.state.lock().await.scheduler.bonds().cloned().collect()
    }

    /// Bond expected to sign the block on top of the current head after `skip` misses
    pub async fn next_minter(&self, skip: u64) -> Option<Bond> {
        let state = self.state.lock().await;
        let height = state.head.as_ref()?.get_height();
        state.scheduler.next_minter(height, skip).cloned()
    }

    /// Dedup lookup shared with the transaction pool
    pub fn is_tx_known(&self, tx_bytes: &[u8], now: u64) -> Result<bool> {
        self.indexer.has_tx(tx_bytes, now)
    }

    pub fn register_tx(&self, tx_bytes: &[u8], expiry: u64) -> Result<()> {
        self.indexer.add_tx(tx_bytes, expiry)
    }

    pub fn purge_expired_txs(&self, now: u64) -> Result<usize> {
        self.indexer.purge_expired_txs(now)
    }

    pub fn flush(&self) -> Result<()> {
        self.indexer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::test_utils::{asset, genesis_chain, next_block, now, signed_transfer};

    #[tokio::test]
    async fn test_genesis_state() {
        let test = genesis_chain("1 GOLD").await;
        let chain = &test.chain;

        assert_eq!(chain.get_chain_height().await, Some(0));
        let balance = chain.get_balance(test.staker.public_key(), &[]).unwrap();
        assert_eq!(balance.gold.to_string(), "1 GOLD");
        assert!(balance.silver.is_zero());
        let supply = chain.get_token_supply().unwrap();
        assert!(supply.gold.value_eq(&asset("1 GOLD")).unwrap());

        let bond = chain.get_bond(test.minter.public_key()).await.unwrap();
        assert_eq!(bond.staker, *test.staker.public_key());
        assert_eq!(
            chain.next_minter(0).await.unwrap().minter,
            *test.minter.public_key()
        );
    }

    #[tokio::test]
    async fn test_second_genesis_rejected() {
        let test = genesis_chain("1 GOLD").await;
        let err = test
            .chain
            .create_genesis_block(&test.minter, &test.staker, vec![asset("1 GOLD")], now())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockchainError::Validation(_)));
    }

    #[tokio::test]
    async fn test_height_mismatch_and_invalid_signer() {
        let test = genesis_chain("1 GOLD").await;
        let chain = &test.chain;
        let head = chain.get_chain_head().await.unwrap();

        let skipped = Block::new(2, head.hash(), head.get_timestamp() + 1, vec![])
            .sign(&test.minter)
            .unwrap();
        assert_eq!(
            chain.add_block(skipped).await.unwrap_err(),
            BlockchainError::HeightMismatch {
                expected: 1,
                got: 2
            }
        );

        let stranger = KeyPair::generate().unwrap();
        let foreign = Block::new(1, head.hash(), head.get_timestamp() + 1, vec![])
            .sign(&stranger)
            .unwrap();
        assert!(matches!(
            chain.add_block(foreign.clone()).await,
            Err(BlockchainError::InvalidSigner(_))
        ));
        chain
            .add_block_with_flags(foreign, SkipFlags::SKIP_BOND_SIGNER)
            .await
            .unwrap();
        assert_eq!(chain.get_chain_height().await, Some(1));
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_and_burns_fee() {
        let test = genesis_chain("10 GOLD").await;
        let chain = &test.chain;
        let recipient = KeyPair::generate().unwrap();

        let ts = test.genesis_time + 1;
        let transfer = signed_transfer(&test.staker, recipient.public_key(), "4 GOLD", "0.5 GOLD", ts);
        let block = next_block(chain, &test.minter, vec![transfer], ts).await;
        chain.add_block(block).await.unwrap();

        let staker = chain.get_balance(test.staker.public_key(), &[]).unwrap();
        let to = chain.get_balance(recipient.public_key(), &[]).unwrap();
        assert!(staker.gold.value_eq(&asset("5.5 GOLD")).unwrap());
        assert!(to.gold.value_eq(&asset("4 GOLD")).unwrap());
        let supply = chain.get_token_supply().unwrap();
        assert!(supply.gold.value_eq(&asset("9.5 GOLD")).unwrap());
    }

    #[tokio::test]
    async fn test_overdraft_leaves_state_untouched() {
        let test = genesis_chain("1 GOLD").await;
        let chain = &test.chain;
        let recipient = KeyPair::generate().unwrap();

        let ts = test.genesis_time + 1;
        let transfer = signed_transfer(&test.staker, recipient.public_key(), "1 GOLD", "0.1 GOLD", ts);
        let block = next_block(chain, &test.minter, vec![transfer], ts).await;
        assert!(matches!(
            chain.add_block(block).await,
            Err(BlockchainError::InsufficientBalance { .. })
        ));
        assert_eq!(chain.get_chain_height().await, Some(0));
        assert!(chain
            .get_balance(recipient.public_key(), &[])
            .unwrap()
            .gold
            .is_zero());
    }

    #[tokio::test]
    async fn test_reward_cannot_exceed_fees() {
        let test = genesis_chain("1 GOLD").await;
        let chain = &test.chain;
        let ts = test.genesis_time + 1;

        let reward = Transaction::new_reward(*test.staker.public_key(), vec![asset("1 GOLD")], ts);
        let block = next_block(chain, &test.minter, vec![reward], ts).await;
        assert!(matches!(
            chain.add_block(block).await,
            Err(BlockchainError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_block_time_must_advance() {
        let test = genesis_chain("1 GOLD").await;
        let chain = &test.chain;
        let block = next_block(chain, &test.minter, vec![], test.genesis_time).await;
        assert!(matches!(
            chain.add_block(block.clone()).await,
            Err(BlockchainError::Validation(_))
        ));
        chain
            .add_block_with_flags(block, SkipFlags::SKIP_TIME)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_index_blocks_commits_prefix_on_failure() {
        let test = genesis_chain("1 GOLD").await;
        let chain = &test.chain;

        let mut blocks = vec![];
        let mut prev = chain.get_chain_head().await.unwrap();
        for i in 1..=3 {
            let block = Block::new(i, prev.hash(), test.genesis_time + i, vec![])
                .sign(&test.minter)
                .unwrap();
            blocks.push(block.clone());
            prev = block;
        }
        // Wrong height breaks the run after block 3
        blocks.push(
            Block::new(9, prev.hash(), test.genesis_time + 9, vec![])
                .sign(&test.minter)
                .unwrap(),
        );

        let err = chain.index_blocks(blocks, SkipFlags::SYNC).await.unwrap_err();
        assert!(matches!(err, BlockchainError::HeightMismatch { .. }));
        assert_eq!(chain.get_chain_height().await, Some(3));
        assert_eq!(chain.get_block(3).await.unwrap().unwrap(), prev);
    }

    #[tokio::test]
    async fn test_reopen_restores_head_and_bonds() {
        let test = genesis_chain("1 GOLD").await;
        let block = next_block(&test.chain, &test.minter, vec![], test.genesis_time + 1).await;
        test.chain.add_block(block.clone()).await.unwrap();
        test.chain.flush().unwrap();
        let dir = test.dir.path().to_path_buf();
        drop(test.chain);

        let reopened = Blockchain::open(&dir).unwrap();
        assert_eq!(reopened.get_chain_head().await, Some(block));
        assert_eq!(reopened.get_bonds().await.len(), 1);
    }

    #[tokio::test]
    async fn test_pending_transactions_fold_into_balance() {
        let test = genesis_chain("10 GOLD").await;
        let recipient = KeyPair::generate().unwrap();
        let pending = vec![signed_transfer(
            &test.staker,
            recipient.public_key(),
            "3 GOLD",
            "1 GOLD",
            test.genesis_time,
        )];
        let projected = test
            .chain
            .get_balance(test.staker.public_key(), &pending)
            .unwrap();
        assert!(projected.gold.value_eq(&asset("6 GOLD")).unwrap());
        let committed = test.chain.get_balance(test.staker.public_key(), &[]).unwrap();
        assert!(committed.gold.value_eq(&asset("10 GOLD")).unwrap());
    }

    #[tokio::test]
    async fn test_transaction_applies_only_once() {
        let test = genesis_chain("10 GOLD").await;
        let chain = &test.chain;
        let recipient = KeyPair::generate().unwrap();

        let ts = test.genesis_time + 1;
        let tx = signed_transfer(&test.staker, recipient.public_key(), "1 GOLD", "0.1 GOLD", ts);
        let block = next_block(chain, &test.minter, vec![tx.clone()], ts).await;
        chain.add_block(block).await.unwrap();

        // Same signed transfer in a later block
        let replay = next_block(chain, &test.minter, vec![tx], ts + 1).await;
        assert_eq!(
            chain.add_block(replay).await.unwrap_err(),
            BlockchainError::DuplicateTransaction
        );

        // Twice within one block
        let twice = signed_transfer(&test.staker, recipient.public_key(), "1 GOLD", "0.1 GOLD", ts + 1);
        let block = next_block(chain, &test.minter, vec![twice.clone(), twice], ts + 1).await;
        assert_eq!(
            chain.add_block(block).await.unwrap_err(),
            BlockchainError::DuplicateTransaction
        );

        assert_eq!(chain.get_chain_height().await, Some(1));
        let to = chain.get_balance(recipient.public_key(), &[]).unwrap();
        assert!(to.gold.value_eq(&asset("1 GOLD")).unwrap());
    }

    #[tokio::test]
    async fn test_dust_amounts_rejected_and_wide_balances_stay_readable() {
        let test = genesis_chain("100 GOLD").await;
        let chain = &test.chain;
        let recipient = KeyPair::generate().unwrap();
        let ts = test.genesis_time + 1;

        let dust = signed_transfer(
            &test.staker,
            recipient.public_key(),
            "0.00000000000000000000001 GOLD",
            "0.1 GOLD",
            ts,
        );
        let block = next_block(chain, &test.minter, vec![dust.clone()], ts).await;
        assert!(matches!(
            chain.add_block(block).await,
            Err(BlockchainError::Validation(_))
        ));

        // Replayed history skips per-tx checks; the stored balance must still read back
        let block = next_block(chain, &test.minter, vec![dust], ts).await;
        chain.index_blocks(vec![block], SkipFlags::SYNC).await.unwrap();
        let staker = chain.get_balance(test.staker.public_key(), &[]).unwrap();
        let expected = asset("99.9 GOLD")
            .sub(&Asset::new(1, 23, AssetSymbol::Gold))
            .unwrap();
        assert_eq!(staker.gold, expected);
        chain.get_token_supply().unwrap();

        let spend = signed_transfer(&test.staker, recipient.public_key(), "1 GOLD", "0.1 GOLD", ts + 1);
        let block = next_block(chain, &test.minter, vec![spend], ts + 1).await;
        chain.add_block(block).await.unwrap();
        assert_eq!(chain.get_chain_height().await, Some(2));
    }

    #[tokio::test]
    async fn test_select_applicable_skips_stale_transactions() {
        let test = genesis_chain("10 GOLD").await;
        let chain = &test.chain;
        let recipient = KeyPair::generate().unwrap();
        let ts = test.genesis_time + 1;

        let first = signed_transfer(&test.staker, recipient.public_key(), "6 GOLD", "0.1 GOLD", ts);
        let overspend = signed_transfer(&test.staker, recipient.public_key(), "5 GOLD", "0.1 GOLD", ts);
        let small = signed_transfer(&test.staker, recipient.public_key(), "1 GOLD", "0.1 GOLD", ts);

        let (selected, rejected) = chain
            .select_applicable(vec![first.clone(), overspend.clone(), small.clone()], ts)
            .await
            .unwrap();
        assert_eq!(selected, vec![first, small]);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, overspend);
        assert!(matches!(
            rejected[0].1,
            BlockchainError::InsufficientBalance { .. }
        ));

        // Selection writes nothing
        assert_eq!(chain.get_chain_height().await, Some(0));
        let staker = chain.get_balance(test.staker.public_key(), &[]).unwrap();
        assert!(staker.gold.value_eq(&asset("10 GOLD")).unwrap());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let test = genesis_chain("1 GOLD").await;
        let mut events = test.chain.subscribe();
        let block = next_block(&test.chain, &test.minter, vec![], test.genesis_time + 1).await;
        test.chain.add_block(block.clone()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), block);
    }
}
