use crate::core::{
    balance_deltas, Blockchain, Transaction, TX_EXPIRY_SECS, TX_MAX_FUTURE_SECS,
};
use crate::error::{BlockchainError, Result};
use crate::utils::{current_timestamp, Decode};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const TX_EVENT_CAPACITY: usize = 1024;

/// Pending transactions waiting for the next locally produced block.
///
/// Admission checks run against the committed ledger with every already queued
/// transaction folded in, so the pool never holds a set of transactions that could not
/// all be applied together.
pub struct TxPool {
    chain: Arc<Blockchain>,
    pending: Mutex<Vec<Transaction>>,
    capacity: usize,
    events: broadcast::Sender<Transaction>,
}

impl TxPool {
    pub fn new(chain: Arc<Blockchain>, capacity: usize) -> TxPool {
        let (events, _) = broadcast::channel(TX_EVENT_CAPACITY);
        TxPool {
            chain,
            pending: Mutex::new(vec![]),
            capacity,
            events,
        }
    }

    /// Notified with every admitted transaction
    pub fn subscribe(&self) -> broadcast::Receiver<Transaction> {
        self.events.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Snapshot of the queue, oldest first
    pub async fn pending(&self) -> Vec<Transaction> {
        self.pending.lock().await.clone()
    }

    /// Admits an encoded transaction and returns it decoded
    pub async fn push(&self, tx_bytes: &[u8]) -> Result<Transaction> {
        let mut pending = self.pending.lock().await;
        let now = current_timestamp()?;

        if self.chain.is_tx_known(tx_bytes, now)? {
            return Err(BlockchainError::DuplicateTransaction);
        }
        let tx = Transaction::from_bytes(tx_bytes)?;
        if let Transaction::Reward(_) = tx {
            return Err(BlockchainError::validation(
                "reward transactions are only minted by block producers",
            ));
        }
        self.check_time_window(&tx, now).await?;
        tx.validate()?;
        self.chain.fee_calculator().validate_fee(&tx)?;

        if pending.len() >= self.capacity {
            return Err(BlockchainError::validation(format!(
                "transaction pool is full ({} pending)",
                self.capacity
            )));
        }
        self.check_balance(&tx, &pending)?;

        self.chain
            .register_tx(tx_bytes, tx.timestamp() + TX_EXPIRY_SECS)?;
        pending.push(tx.clone());
        debug!("Admitted transaction {} ({} pending)", tx.hash_hex(), pending.len());
        drop(pending);

        let _ = self.events.send(tx.clone());
        Ok(tx)
    }

    async fn check_time_window(&self, tx: &Transaction, now: u64) -> Result<()> {
        let timestamp = tx.timestamp();
        if timestamp + TX_EXPIRY_SECS <= now {
            return Err(BlockchainError::validation("transaction has expired"));
        }
        if timestamp > now + TX_MAX_FUTURE_SECS {
            return Err(BlockchainError::validation(
                "transaction timestamp is too far in the future",
            ));
        }
        if let Some(head) = self.chain.get_chain_head().await {
            if timestamp + TX_EXPIRY_SECS <= head.get_timestamp() {
                return Err(BlockchainError::validation(
                    "transaction is older than the chain head allows",
                ));
            }
        }
        Ok(())
    }

    // Committed balance, minus everything queued, minus this transaction must stay >= 0
    fn check_balance(&self, tx: &Transaction, pending: &[Transaction]) -> Result<()> {
        let payer = match tx.payer() {
            Some(payer) => *payer,
            None => return Ok(()),
        };
        let available = self.chain.get_balance(&payer, pending)?;
        let mut projected = available.clone();
        for (account, delta) in balance_deltas(tx)? {
            if account != payer {
                continue;
            }
            projected.add(&delta)?;
            if projected.get(delta.symbol()).is_negative() {
                return Err(BlockchainError::InsufficientBalance {
                    required: delta.neg().to_string(),
                    available: available.get(delta.symbol()).to_string(),
                });
            }
        }
        if let Transaction::Bond(bond) = tx {
            if projected.gold.lt(&bond.stake_amt)? {
                return Err(BlockchainError::InsufficientBalance {
                    required: bond.stake_amt.to_string(),
                    available: projected.gold.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Drains the queue for block production, dropping anything that expired while queued
    pub async fn pop_all(&self) -> Vec<Transaction> {
        let mut pending = self.pending.lock().await;
        let mut drained = std::mem::take(&mut *pending);
        drop(pending);

        let now = match current_timestamp() {
            Ok(now) => now,
            Err(e) => {
                warn!("Clock unavailable while draining the pool: {e}");
                return drained;
            }
        };
        let before = drained.len();
        drained.retain(|tx| tx.timestamp() + TX_EXPIRY_SECS > now);
        if drained.len() < before {
            info!("Dropped {} expired transaction(s)", before - drained.len());
        }
        if let Err(e) = self.chain.purge_expired_txs(now) {
            warn!("Failed to purge expired dedup entries: {e}");
        }
        drained
    }

    /// Evicts queued transactions that a block from another minter already included
    pub async fn remove_included(&self, included: &[Transaction]) -> usize {
        let hashes: HashSet<[u8; 32]> = included.iter().map(Transaction::hash).collect();
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|tx| !hashes.contains(&tx.hash()));
        let removed = before - pending.len();
        if removed > 0 {
            debug!("Evicted {removed} included transaction(s) from the pool");
        }
        removed
    }
}
