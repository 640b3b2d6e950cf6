// Block production state machine.
// While running, one timer task sleeps until the next block is due (head timestamp plus
// the block interval). When it fires I either mint the block myself or, if another bond
// holds the turn, wait a shorter missed-block delay and then skip that minter. Produced
// and received blocks both go through the same exclusive section so they cannot race.

use crate::core::{Asset, Block, Blockchain, Bond, SignedBlock, Transaction};
use crate::error::{BlockchainError, Result};
use crate::storage::TxPool;
use crate::utils::{current_timestamp, Encode};
use crate::wallet::KeyPair;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub block_interval: Duration,
    pub missed_block_delay: Duration,
    /// No timer; blocks are minted on demand with `produce_now`
    pub regtest: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(3),
            missed_block_delay: Duration::from_millis(1500),
            regtest: false,
        }
    }
}

#[derive(Debug, Default)]
struct ProducerState {
    running: bool,
    missed: u64,
    // Head height at which the missed-block timer was armed
    waiting_at: Option<u64>,
}

pub struct Producer {
    chain: Arc<Blockchain>,
    pool: Arc<TxPool>,
    minter: Option<KeyPair>,
    config: ProducerConfig,
    state: Mutex<ProducerState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    rearm: Notify,
}

impl Producer {
    pub fn new(
        chain: Arc<Blockchain>,
        pool: Arc<TxPool>,
        minter: Option<KeyPair>,
        config: ProducerConfig,
    ) -> Producer {
        Producer {
            chain,
            pool,
            minter,
            config,
            state: Mutex::new(ProducerState::default()),
            timer: Mutex::new(None),
            rearm: Notify::new(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn missed(&self) -> u64 {
        self.state.lock().await.missed
    }

    pub async fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.running {
                return;
            }
            state.running = true;
            state.waiting_at = None;
        }
        if self.config.regtest {
            info!("Block producer started in regtest mode, timer disabled");
            return;
        }
        let task = tokio::spawn(Arc::clone(self).run());
        *self.timer.lock().await = Some(task);
        info!(
            "Block producer started (interval {:?}, minter {})",
            self.config.block_interval,
            self.minter
                .as_ref()
                .map_or_else(|| "none".to_string(), |k| k.public_key().to_string())
        );
    }

    pub async fn stop(&self) {
        self.state.lock().await.running = false;
        if let Some(task) = self.timer.lock().await.take() {
            task.abort();
            info!("Block producer stopped");
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            let delay = self.next_delay().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.on_timer().await {
                        if e.is_fatal() {
                            error!("Block production failed: {e}");
                        } else {
                            warn!("Block production failed: {e}");
                        }
                    }
                }
                _ = self.rearm.notified() => {
                    debug!("Producer timer re-armed for a new head");
                }
            }
        }
    }

    async fn next_delay(&self) -> Duration {
        if self.state.lock().await.waiting_at.is_some() {
            return self.config.missed_block_delay;
        }
        let head = match self.chain.get_chain_head().await {
            Some(head) => head,
            None => return self.config.block_interval,
        };
        let due = Duration::from_secs(head.get_timestamp()) + self.config.block_interval;
        match current_timestamp() {
            Ok(now) => due.saturating_sub(Duration::from_secs(now)),
            Err(_) => self.config.block_interval,
        }
    }

    async fn on_timer(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(());
        }
        let head = match self.chain.get_chain_head().await {
            Some(head) => head,
            None => return Ok(()),
        };
        if state.waiting_at == Some(head.get_height()) {
            state.missed += 1;
            info!(
                "Minter missed block {}, skipping to turn {}",
                head.get_height() + 1,
                state.missed
            );
        }
        state.waiting_at = None;

        let bond = match self.chain.next_minter(state.missed).await {
            Some(bond) => bond,
            None => return Ok(()),
        };
        match &self.minter {
            Some(key) if *key.public_key() == bond.minter => {
                self.produce_block(&mut state, key, &bond, &head).await?;
            }
            _ => {
                debug!("Waiting for {} to mint block {}", bond.minter, head.get_height() + 1);
                state.waiting_at = Some(head.get_height());
            }
        }
        Ok(())
    }

    // Drains the pool, pays its fees to the staker, signs and appends
    async fn produce_block(
        &self,
        state: &mut ProducerState,
        key: &KeyPair,
        bond: &Bond,
        head: &SignedBlock,
    ) -> Result<SignedBlock> {
        let drained = self.pool.pop_all().await;
        let timestamp = current_timestamp()?.max(head.get_timestamp() + 1);
        let (mut transactions, rejected) =
            self.chain.select_applicable(drained, timestamp).await?;
        for (tx, e) in &rejected {
            warn!(
                "Leaving transaction {} out of block {}: {e}",
                tx.hash_hex(),
                head.get_height() + 1
            );
        }
        self.release(rejected.iter().map(|(tx, _)| tx));

        let (gold, silver) = self
            .chain
            .fee_calculator()
            .collected_fees(&transactions)?;
        let rewards: Vec<Asset> = [gold, silver]
            .into_iter()
            .filter(Asset::is_positive)
            .collect();
        if !rewards.is_empty() {
            transactions.push(Transaction::new_reward(bond.staker, rewards, timestamp));
        }

        let tx_count = transactions.len();
        let block = Block::new(head.get_height() + 1, head.hash(), timestamp, transactions)
            .sign(key)?;
        if let Err(e) = self.chain.add_block(block.clone()).await {
            error!(
                "Failed to append produced block {}, dropping {tx_count} transaction(s): {e}",
                block.get_height()
            );
            self.release(block.get_transactions().iter());
            return Err(e);
        }
        state.missed = 0;
        state.waiting_at = None;
        info!("Produced block {} ({})", block.get_height(), block.hash_hex());
        Ok(block)
    }

    // Dropped transactions may be submitted again
    fn release<'a>(&self, dropped: impl Iterator<Item = &'a Transaction>) {
        for tx in dropped {
            if let Err(e) = self.chain.forget_tx(&tx.to_bytes()) {
                warn!("Failed to release transaction {}: {e}", tx.hash_hex());
            }
        }
    }

    /// Accepts a block minted elsewhere if it comes from the scheduled minter
    pub async fn handle_block(&self, block: SignedBlock) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(expected) = self.chain.next_minter(state.missed).await {
            if *block.signing_key() != expected.minter {
                return Err(BlockchainError::InvalidSigner(format!(
                    "block {} signed by {}, expected {}",
                    block.get_height(),
                    block.signing_key(),
                    expected.minter
                )));
            }
        }
        if !self.config.regtest {
            if let Some(head) = self.chain.get_chain_head().await {
                let elapsed =
                    Duration::from_secs(block.get_timestamp().saturating_sub(head.get_timestamp()));
                if elapsed < self.config.block_interval {
                    return Err(BlockchainError::validation(format!(
                        "block {} arrived before its slot",
                        block.get_height()
                    )));
                }
            }
        }

        self.chain.add_block(block.clone()).await?;
        self.pool.remove_included(block.get_transactions()).await;
        state.missed = 0;
        state.waiting_at = None;
        drop(state);
        self.rearm.notify_one();
        Ok(())
    }

    /// Mints the next block immediately; used by regtest nodes
    pub async fn produce_now(&self) -> Result<SignedBlock> {
        let mut state = self.state.lock().await;
        let key = self
            .minter
            .as_ref()
            .ok_or_else(|| BlockchainError::Config("node has no minter key".to_string()))?;
        let head = self
            .chain
            .get_chain_head()
            .await
            .ok_or_else(|| BlockchainError::validation("chain has no genesis block"))?;
        let bond = self
            .chain
            .next_minter(state.missed)
            .await
            .ok_or_else(|| BlockchainError::validation("no bonded minters"))?;
        if bond.minter != *key.public_key() {
            return Err(BlockchainError::InvalidSigner(format!(
                "it is {}'s turn to mint",
                bond.minter
            )));
        }
        self.produce_block(&mut state, key, &bond, &head).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::test_utils::{asset, genesis_chain, next_block, now, signed_transfer};

    fn regtest() -> ProducerConfig {
        ProducerConfig {
            regtest: true,
            ..ProducerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_produce_now_pays_fees_to_staker() {
        let test = genesis_chain("10 GOLD").await;
        let pool = Arc::new(TxPool::new(test.chain.clone(), 100));
        let producer = Producer::new(
            test.chain.clone(),
            pool.clone(),
            Some(test.minter.clone()),
            regtest(),
        );
        let to = KeyPair::generate().unwrap();
        let tx = signed_transfer(&test.staker, to.public_key(), "1 GOLD", "0.1 GOLD", now());
        pool.push(&tx.to_bytes()).await.unwrap();

        let block = producer.produce_now().await.unwrap();
        assert_eq!(block.get_height(), 1);
        assert_eq!(block.get_transactions().len(), 2);
        assert!(pool.is_empty().await);

        let staker = test.chain.get_balance(test.staker.public_key(), &[]).unwrap();
        assert!(staker.gold.value_eq(&asset("9 GOLD")).unwrap());
        let supply = test.chain.get_token_supply().unwrap();
        assert!(supply.gold.value_eq(&asset("10 GOLD")).unwrap());
    }

    #[tokio::test]
    async fn test_produce_now_requires_turn() {
        let test = genesis_chain("1 GOLD").await;
        let pool = Arc::new(TxPool::new(test.chain.clone(), 100));
        let outsider = KeyPair::generate().unwrap();
        let producer = Producer::new(test.chain.clone(), pool, Some(outsider), regtest());
        assert!(matches!(
            producer.produce_now().await,
            Err(BlockchainError::InvalidSigner(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_block_checks_signer_and_slot() {
        let test = genesis_chain("10 GOLD").await;
        let pool = Arc::new(TxPool::new(test.chain.clone(), 100));
        let producer = Producer::new(
            test.chain.clone(),
            pool.clone(),
            None,
            ProducerConfig::default(),
        );

        let stranger = KeyPair::generate().unwrap();
        let foreign = next_block(&test.chain, &stranger, vec![], test.genesis_time + 3).await;
        assert!(matches!(
            producer.handle_block(foreign).await,
            Err(BlockchainError::InvalidSigner(_))
        ));

        let early = next_block(&test.chain, &test.minter, vec![], test.genesis_time + 1).await;
        assert!(matches!(
            producer.handle_block(early).await,
            Err(BlockchainError::Validation(_))
        ));

        // The pool copy of an included transaction is evicted
        let to = KeyPair::generate().unwrap();
        let tx = signed_transfer(&test.staker, to.public_key(), "1 GOLD", "0.1 GOLD", now());
        pool.push(&tx.to_bytes()).await.unwrap();
        let block = next_block(&test.chain, &test.minter, vec![tx], now()).await;
        producer.handle_block(block).await.unwrap();
        assert!(pool.is_empty().await);
        assert_eq!(test.chain.get_chain_height().await, Some(1));
    }

    #[tokio::test]
    async fn test_stale_pool_entry_does_not_sink_the_block() {
        let test = genesis_chain("20 GOLD").await;
        let chain = &test.chain;
        let pool = Arc::new(TxPool::new(chain.clone(), 100));
        let producer = Producer::new(
            chain.clone(),
            pool.clone(),
            Some(test.minter.clone()),
            regtest(),
        );
        let other = KeyPair::generate().unwrap();
        let sink = KeyPair::generate().unwrap();

        let ts = test.genesis_time + 1;
        let funding = signed_transfer(&test.staker, other.public_key(), "5 GOLD", "0.1 GOLD", ts);
        let block = next_block(chain, &test.minter, vec![funding], ts).await;
        chain.add_block(block).await.unwrap();

        let stale = signed_transfer(&test.staker, sink.public_key(), "7 GOLD", "0.1 GOLD", now());
        let independent = signed_transfer(&other, sink.public_key(), "1 GOLD", "0.1 GOLD", now());
        pool.push(&stale.to_bytes()).await.unwrap();
        pool.push(&independent.to_bytes()).await.unwrap();

        // Another minter's block spends most of the staker's funds first
        let spend = signed_transfer(&test.staker, sink.public_key(), "10 GOLD", "0.1 GOLD", now());
        let block = next_block(chain, &test.minter, vec![spend], now()).await;
        chain.add_block(block).await.unwrap();

        let produced = producer.produce_now().await.unwrap();
        assert!(produced.get_transactions().contains(&independent));
        assert!(!produced.get_transactions().contains(&stale));
        assert!(pool.is_empty().await);
        let sink_balance = chain.get_balance(sink.public_key(), &[]).unwrap();
        assert!(sink_balance.gold.value_eq(&asset("11 GOLD")).unwrap());

        // The skipped transaction is judged afresh, the included one stays spent
        assert!(matches!(
            pool.push(&stale.to_bytes()).await,
            Err(BlockchainError::InsufficientBalance { .. })
        ));
        assert_eq!(
            pool.push(&independent.to_bytes()).await.unwrap_err(),
            BlockchainError::DuplicateTransaction
        );
    }

    #[tokio::test]
    async fn test_sub_second_interval_still_limits_block_rate() {
        let test = genesis_chain("1 GOLD").await;
        let pool = Arc::new(TxPool::new(test.chain.clone(), 100));
        let producer = Producer::new(
            test.chain.clone(),
            pool,
            None,
            ProducerConfig {
                block_interval: Duration::from_millis(1500),
                missed_block_delay: Duration::from_millis(750),
                regtest: false,
            },
        );

        let early = next_block(&test.chain, &test.minter, vec![], test.genesis_time + 1).await;
        assert!(matches!(
            producer.handle_block(early).await,
            Err(BlockchainError::Validation(_))
        ));
        let on_time = next_block(&test.chain, &test.minter, vec![], test.genesis_time + 2).await;
        producer.handle_block(on_time).await.unwrap();
        assert_eq!(test.chain.get_chain_height().await, Some(1));
    }

    #[tokio::test]
    async fn test_timer_produces_when_due() {
        let test = genesis_chain("1 GOLD").await;
        let pool = Arc::new(TxPool::new(test.chain.clone(), 100));
        let producer = Arc::new(Producer::new(
            test.chain.clone(),
            pool,
            Some(test.minter.clone()),
            ProducerConfig {
                block_interval: Duration::from_secs(1),
                missed_block_delay: Duration::from_millis(500),
                regtest: false,
            },
        ));
        let mut events = test.chain.subscribe();
        producer.start().await;

        let block = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block.get_height(), 1);
        assert_eq!(block.signing_key(), test.minter.public_key());
        producer.stop().await;
        assert!(!producer.is_running().await);
    }

    #[tokio::test]
    async fn test_missed_turn_passes_to_next_bond() {
        let test = genesis_chain("10 GOLD").await;
        let second = KeyPair::generate().unwrap();

        // Bond a second minter so the schedule has two slots
        let ts = test.genesis_time + 1;
        let mut bond = Transaction::new_bond(
            *second.public_key(),
            *test.staker.public_key(),
            asset("1 GOLD"),
            asset("0.1 GOLD"),
            asset("0.1 GOLD"),
            ts,
        );
        bond.sign(&second).unwrap();
        bond.sign(&test.staker).unwrap();
        let block = next_block(&test.chain, &test.minter, vec![bond], ts).await;
        test.chain.add_block(block).await.unwrap();
        assert_eq!(test.chain.get_bonds().await.len(), 2);

        // Run the producer for whichever key is not scheduled first
        let scheduled = test.chain.next_minter(0).await.unwrap().minter;
        let local = if scheduled == *test.minter.public_key() {
            second.clone()
        } else {
            test.minter.clone()
        };
        let pool = Arc::new(TxPool::new(test.chain.clone(), 100));
        let producer = Arc::new(Producer::new(
            test.chain.clone(),
            pool,
            Some(local.clone()),
            ProducerConfig {
                block_interval: Duration::from_secs(1),
                missed_block_delay: Duration::from_millis(200),
                regtest: false,
            },
        ));
        let mut events = test.chain.subscribe();
        producer.start().await;

        let block = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        producer.stop().await;
        assert_eq!(block.get_height(), 2);
        assert_eq!(block.signing_key(), local.public_key());
    }
}
