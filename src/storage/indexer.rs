// Sled-backed ledger index.
// Every namespace is its own tree; values are either big-endian integers, codec bytes
// (bonds) or bincode pairs of (signed big-endian amount, decimals) per symbol (balances,
// supply). Dedup values are the expiry followed by one state byte.
// Block application goes through `IndexBatch`, which buffers writes in memory and is
// committed with one multi-tree transaction, so a crash never leaves half a block indexed.

use crate::core::{Asset, AssetSymbol, Balance, Bond};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize, Decode, Encode};
use crate::wallet::PublicKey;
use log::{debug, info};
use num_bigint::BigInt;
use sled::transaction::TransactionError;
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

const CHAIN_TREE: &str = "chain";
const BLOCK_POSITIONS_TREE: &str = "block_positions";
const BALANCES_TREE: &str = "balances";
const BONDS_TREE: &str = "bonds";
const SUPPLY_TREE: &str = "token_supply";
const TX_DEDUP_TREE: &str = "tx_dedup";

const CHAIN_HEIGHT_KEY: &str = "height";
const TOKEN_SUPPLY_KEY: &str = "supply";

// Dedup entry states
const TX_QUEUED: u8 = 0;
const TX_APPLIED: u8 = 1;

fn open_tree(db: &Db, name: &str) -> Result<Tree> {
    db.open_tree(name)
        .map_err(|e| BlockchainError::Database(format!("Failed to open {name} tree: {e}")))
}

fn u64_from_ivec(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| BlockchainError::Database(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

type StoredAsset = (Vec<u8>, u8);

fn store_asset(asset: &Asset) -> StoredAsset {
    (asset.amount().to_signed_bytes_be(), asset.decimals())
}

fn load_asset((amount, decimals): StoredAsset, symbol: AssetSymbol) -> Asset {
    Asset::new(BigInt::from_signed_bytes_be(&amount), decimals, symbol)
}

fn encode_balance(balance: &Balance) -> Result<Vec<u8>> {
    serialize(&(store_asset(&balance.gold), store_asset(&balance.silver)))
}

fn decode_balance(bytes: &[u8]) -> Result<Balance> {
    let (gold, silver): (StoredAsset, StoredAsset) = deserialize(bytes)?;
    Balance::new(
        load_asset(gold, AssetSymbol::Gold),
        load_asset(silver, AssetSymbol::Silver),
    )
}

fn dedup_value(expiry: u64, state: u8) -> Vec<u8> {
    let mut value = expiry.to_be_bytes().to_vec();
    value.push(state);
    value
}

// Entries written before the state byte existed count as applied
fn parse_dedup(bytes: &[u8]) -> Result<(u64, u8)> {
    match bytes.len() {
        8 => Ok((u64_from_ivec(bytes)?, TX_APPLIED)),
        9 => Ok((u64_from_ivec(&bytes[..8])?, bytes[8])),
        n => Err(BlockchainError::Database(format!(
            "malformed dedup entry of {n} bytes"
        ))),
    }
}

pub struct Indexer {
    db: Db,
    chain: Tree,
    block_positions: Tree,
    balances: Tree,
    bonds: Tree,
    supply: Tree,
    tx_dedup: Tree,
}

impl Indexer {
    pub fn open(path: &Path) -> Result<Indexer> {
        let db = sled::open(path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open index: {e}")))?;
        info!("Opened index at {}", path.display());
        Ok(Indexer {
            chain: open_tree(&db, CHAIN_TREE)?,
            block_positions: open_tree(&db, BLOCK_POSITIONS_TREE)?,
            balances: open_tree(&db, BALANCES_TREE)?,
            bonds: open_tree(&db, BONDS_TREE)?,
            supply: open_tree(&db, SUPPLY_TREE)?,
            tx_dedup: open_tree(&db, TX_DEDUP_TREE)?,
            db,
        })
    }

    /// Height of the last indexed block, `None` before genesis
    pub fn get_chain_height(&self) -> Result<Option<u64>> {
        self.chain
            .get(CHAIN_HEIGHT_KEY)?
            .map(|v| u64_from_ivec(&v))
            .transpose()
    }

    /// Block log offset of the block at `height`
    pub fn get_block_pos(&self, height: u64) -> Result<Option<u64>> {
        self.block_positions
            .get(height.to_be_bytes())?
            .map(|v| u64_from_ivec(&v))
            .transpose()
    }

    pub fn get_balance(&self, key: &PublicKey) -> Result<Option<Balance>> {
        self.balances
            .get(&key.as_bytes()[..])?
            .map(|v| decode_balance(&v))
            .transpose()
    }

    pub fn get_bond(&self, minter: &PublicKey) -> Result<Option<Bond>> {
        self.bonds
            .get(&minter.as_bytes()[..])?
            .map(|v| Bond::from_bytes(&v))
            .transpose()
    }

    pub fn get_bonds(&self) -> Result<Vec<Bond>> {
        let mut bonds = vec![];
        for item in self.bonds.iter() {
            let (_, value) = item?;
            bonds.push(Bond::from_bytes(&value)?);
        }
        Ok(bonds)
    }

    pub fn get_token_supply(&self) -> Result<Balance> {
        match self.supply.get(TOKEN_SUPPLY_KEY)? {
            Some(v) => decode_balance(&v),
            None => Ok(Balance::default()),
        }
    }

    fn dedup_entry(&self, tx_bytes: &[u8], now: u64) -> Result<Option<u8>> {
        match self.tx_dedup.get(tx_bytes)? {
            Some(value) => {
                let (expiry, state) = parse_dedup(&value)?;
                Ok((expiry > now).then_some(state))
            }
            None => Ok(None),
        }
    }

    /// True while an unexpired dedup entry exists for `tx_bytes`, queued or applied
    pub fn has_tx(&self, tx_bytes: &[u8], now: u64) -> Result<bool> {
        Ok(self.dedup_entry(tx_bytes, now)?.is_some())
    }

    /// True while `tx_bytes` is recorded as part of an applied block
    pub fn has_applied_tx(&self, tx_bytes: &[u8], now: u64) -> Result<bool> {
        Ok(self.dedup_entry(tx_bytes, now)? == Some(TX_APPLIED))
    }

    /// Records a transaction admitted to the pool but not yet in a block
    pub fn add_tx(&self, tx_bytes: &[u8], expiry: u64) -> Result<()> {
        self.tx_dedup
            .insert(tx_bytes, dedup_value(expiry, TX_QUEUED))?;
        Ok(())
    }

    /// Forgets a queued entry; applied entries stay until they expire
    pub fn remove_queued_tx(&self, tx_bytes: &[u8]) -> Result<bool> {
        let queued = match self.tx_dedup.get(tx_bytes)? {
            Some(value) => parse_dedup(&value)?.1 == TX_QUEUED,
            None => false,
        };
        if queued {
            self.tx_dedup.remove(tx_bytes)?;
        }
        Ok(queued)
    }

    /// Drops dedup entries whose expiry is at or before `now`
    pub fn purge_expired_txs(&self, now: u64) -> Result<usize> {
        let mut expired = vec![];
        for item in self.tx_dedup.iter() {
            let (key, value) = item?;
            if parse_dedup(&value)?.0 <= now {
                expired.push(key);
            }
        }
        for key in &expired {
            self.tx_dedup.remove(key)?;
        }
        if !expired.is_empty() {
            debug!("Purged {} expired dedup entries", expired.len());
        }
        Ok(expired.len())
    }

    /// Commits every buffered write of `batch` atomically
    pub fn write_batch(&self, batch: &IndexBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Values are encoded up front; the transaction closure may run more than once
        let balances = batch
            .balances
            .iter()
            .map(|(key, balance)| Ok((key.as_bytes().to_vec(), encode_balance(balance)?)))
            .collect::<Result<Vec<_>>>()?;
        let bonds: Vec<(Vec<u8>, Vec<u8>)> = batch
            .bonds
            .iter()
            .map(|(minter, bond)| (minter.as_bytes().to_vec(), bond.to_bytes()))
            .collect();
        let supply = batch.supply.as_ref().map(encode_balance).transpose()?;
        let txs: Vec<(&[u8], Vec<u8>)> = batch
            .txs
            .iter()
            .map(|(tx_bytes, expiry)| (tx_bytes.as_slice(), dedup_value(*expiry, TX_APPLIED)))
            .collect();

        (
            &self.chain,
            &self.block_positions,
            &self.balances,
            &self.bonds,
            &self.supply,
            &self.tx_dedup,
        )
            .transaction(|(chain, positions, balance_tree, bond_tree, supply_tree, dedup)| {
                for (height, offset) in &batch.block_positions {
                    positions.insert(&height.to_be_bytes()[..], &offset.to_be_bytes()[..])?;
                }
                for (key, value) in &balances {
                    balance_tree.insert(key.as_slice(), value.as_slice())?;
                }
                for (key, value) in &bonds {
                    bond_tree.insert(key.as_slice(), value.as_slice())?;
                }
                if let Some(value) = &supply {
                    supply_tree.insert(TOKEN_SUPPLY_KEY, value.as_slice())?;
                }
                for (tx_bytes, value) in &txs {
                    dedup.insert(*tx_bytes, value.as_slice())?;
                }
                if let Some(height) = batch.height {
                    chain.insert(CHAIN_HEIGHT_KEY, &height.to_be_bytes()[..])?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError| {
                BlockchainError::Database(format!("Failed to commit index batch: {e}"))
            })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory write buffer over an [`Indexer`].
///
/// Reads through the batch see its own pending writes first, then the committed index,
/// which lets a whole range of blocks be applied before a single commit.
#[derive(Debug, Default, Clone)]
pub struct IndexBatch {
    height: Option<u64>,
    block_positions: Vec<(u64, u64)>,
    balances: HashMap<PublicKey, Balance>,
    bonds: BTreeMap<PublicKey, Bond>,
    supply: Option<Balance>,
    txs: Vec<(Vec<u8>, u64)>,
}

impl IndexBatch {
    pub fn new() -> IndexBatch {
        IndexBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.height.is_none()
            && self.block_positions.is_empty()
            && self.balances.is_empty()
            && self.bonds.is_empty()
            && self.supply.is_none()
            && self.txs.is_empty()
    }

    pub fn height(&self) -> Option<u64> {
        self.height
    }

    pub fn set_chain_height(&mut self, height: u64) {
        self.height = Some(height);
    }

    pub fn add_block_pos(&mut self, height: u64, offset: u64) {
        self.block_positions.push((height, offset));
    }

    pub fn set_balance(&mut self, key: PublicKey, balance: Balance) {
        self.balances.insert(key, balance);
    }

    pub fn insert_bond(&mut self, bond: Bond) {
        self.bonds.insert(bond.minter, bond);
    }

    pub fn set_token_supply(&mut self, supply: Balance) {
        self.supply = Some(supply);
    }

    pub fn add_tx(&mut self, tx_bytes: Vec<u8>, expiry: u64) {
        self.txs.push((tx_bytes, expiry));
    }

    pub fn has_tx(&self, tx_bytes: &[u8]) -> bool {
        self.txs.iter().any(|(bytes, _)| bytes == tx_bytes)
    }

    /// Buffered balance if present, otherwise committed, otherwise zero
    pub fn balance(&self, indexer: &Indexer, key: &PublicKey) -> Result<Balance> {
        if let Some(balance) = self.balances.get(key) {
            return Ok(balance.clone());
        }
        Ok(indexer.get_balance(key)?.unwrap_or_default())
    }

    pub fn token_supply(&self, indexer: &Indexer) -> Result<Balance> {
        match &self.supply {
            Some(supply) => Ok(supply.clone()),
            None => indexer.get_token_supply(),
        }
    }

    pub fn block_pos(&self, indexer: &Indexer, height: u64) -> Result<Option<u64>> {
        if let Some((_, offset)) = self.block_positions.iter().find(|(h, _)| *h == height) {
            return Ok(Some(*offset));
        }
        indexer.get_block_pos(height)
    }

    pub fn bonds(&self) -> impl Iterator<Item = &Bond> {
        self.bonds.values()
    }
}
