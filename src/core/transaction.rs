// Transactions are a closed set of three kinds: system-minted rewards, transfers between
// accounts, and bonds that give a minter key the right to sign blocks.
// Every kind shares a timestamp, a fee and an ordered list of signature pairs; the
// signatures always cover the unsigned encoding (everything except the signature list).

use crate::core::{Asset, AssetSymbol, MAX_PRECISION};
use crate::error::{BlockchainError, Result};
use crate::utils::{double_sha256, Decode, Decoder, Encode, Encoder, MAX_ASSET_STR_LEN};
use crate::wallet::{KeyPair, PublicKey, SigPair};
use data_encoding::HEXLOWER;

/// Memos must be strictly shorter than this many bytes
pub const MAX_MEMO_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxType {
    Reward = 0,
    Transfer = 1,
    Bond = 2,
}

impl TxType {
    fn from_u8(value: u8) -> Result<TxType> {
        match value {
            0 => Ok(TxType::Reward),
            1 => Ok(TxType::Transfer),
            2 => Ok(TxType::Bond),
            n => Err(BlockchainError::Serialization(format!(
                "Unknown transaction type {n}"
            ))),
        }
    }
}

// Fields every transaction kind carries
#[derive(Debug, Clone, PartialEq)]
pub struct TxBase {
    pub timestamp: u64,
    pub fee: Asset,
    pub signature_pairs: Vec<SigPair>,
}

impl TxBase {
    pub fn new(timestamp: u64, fee: Asset) -> TxBase {
        TxBase {
            timestamp,
            fee,
            signature_pairs: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RewardTx {
    pub base: TxBase,
    pub to: PublicKey,
    pub rewards: Vec<Asset>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferTx {
    pub base: TxBase,
    pub from: PublicKey,
    pub to: PublicKey,
    pub amount: Asset,
    pub memo: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BondTx {
    pub base: TxBase,
    pub minter: PublicKey,
    pub staker: PublicKey,
    pub stake_amt: Asset,
    pub bond_fee: Asset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transaction {
    Reward(RewardTx),
    Transfer(TransferTx),
    Bond(BondTx),
}

impl Transaction {
    pub fn new_reward(to: PublicKey, rewards: Vec<Asset>, timestamp: u64) -> Transaction {
        Transaction::Reward(RewardTx {
            base: TxBase::new(timestamp, Asset::zero(AssetSymbol::Gold)),
            to,
            rewards,
        })
    }

    pub fn new_transfer(
        from: PublicKey,
        to: PublicKey,
        amount: Asset,
        fee: Asset,
        memo: Option<Vec<u8>>,
        timestamp: u64,
    ) -> Transaction {
        Transaction::Transfer(TransferTx {
            base: TxBase::new(timestamp, fee),
            from,
            to,
            amount,
            // An empty memo is indistinguishable from no memo on the wire
            memo: memo.filter(|m| !m.is_empty()),
        })
    }

    pub fn new_bond(
        minter: PublicKey,
        staker: PublicKey,
        stake_amt: Asset,
        bond_fee: Asset,
        fee: Asset,
        timestamp: u64,
    ) -> Transaction {
        Transaction::Bond(BondTx {
            base: TxBase::new(timestamp, fee),
            minter,
            staker,
            stake_amt,
            bond_fee,
        })
    }

    pub fn tx_type(&self) -> TxType {
        match self {
            Transaction::Reward(_) => TxType::Reward,
            Transaction::Transfer(_) => TxType::Transfer,
            Transaction::Bond(_) => TxType::Bond,
        }
    }

    pub fn base(&self) -> &TxBase {
        match self {
            Transaction::Reward(tx) => &tx.base,
            Transaction::Transfer(tx) => &tx.base,
            Transaction::Bond(tx) => &tx.base,
        }
    }

    fn base_mut(&mut self) -> &mut TxBase {
        match self {
            Transaction::Reward(tx) => &mut tx.base,
            Transaction::Transfer(tx) => &mut tx.base,
            Transaction::Bond(tx) => &mut tx.base,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.base().timestamp
    }

    pub fn fee(&self) -> &Asset {
        &self.base().fee
    }

    pub fn signature_pairs(&self) -> &[SigPair] {
        &self.base().signature_pairs
    }

    /// The account paying the fee, if the kind has one
    pub fn payer(&self) -> Option<&PublicKey> {
        match self {
            Transaction::Reward(_) => None,
            Transaction::Transfer(tx) => Some(&tx.from),
            Transaction::Bond(tx) => Some(&tx.staker),
        }
    }

    /// Encoding without the signature list; this is what gets signed
    pub fn unsigned_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_unsigned(&mut enc);
        enc.into_bytes()
    }

    fn encode_unsigned(&self, enc: &mut Encoder) {
        let base = self.base();
        enc.write_u8(self.tx_type() as u8);
        enc.write_date(base.timestamp);
        enc.write_asset(&base.fee);
        match self {
            Transaction::Reward(tx) => {
                enc.write_public_key(&tx.to);
                enc.write_array(&tx.rewards, |e, asset| e.write_asset(asset));
            }
            Transaction::Transfer(tx) => {
                enc.write_public_key(&tx.from);
                enc.write_public_key(&tx.to);
                enc.write_asset(&tx.amount);
                enc.write_bytes(tx.memo.as_deref());
            }
            Transaction::Bond(tx) => {
                enc.write_public_key(&tx.minter);
                enc.write_public_key(&tx.staker);
                enc.write_asset(&tx.stake_amt);
                enc.write_asset(&tx.bond_fee);
            }
        }
    }

    /// Double SHA-256 over the full encoding, signatures included
    pub fn hash(&self) -> [u8; 32] {
        double_sha256(&self.to_bytes())
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash())
    }

    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<()> {
        let pair = key_pair.sign(&self.unsigned_bytes())?;
        self.base_mut().signature_pairs.push(pair);
        Ok(())
    }

    /// Context-free checks: shape, symbols, amounts and signatures.
    /// Balance, fee minimums and time windows need chain state and live in `Blockchain`.
    pub fn validate(&self) -> Result<()> {
        if self.timestamp() > u64::from(u32::MAX) {
            return Err(BlockchainError::validation(
                "timestamp does not fit in 32-bit seconds",
            ));
        }
        if self
            .assets()
            .iter()
            .any(|asset| asset.to_string().len() > MAX_ASSET_STR_LEN)
        {
            return Err(BlockchainError::validation(format!(
                "asset text exceeds {MAX_ASSET_STR_LEN} bytes"
            )));
        }
        if let Some(asset) = self
            .assets()
            .into_iter()
            .find(|asset| asset.decimals() > MAX_PRECISION)
        {
            return Err(BlockchainError::validation(format!(
                "{asset} has more than {MAX_PRECISION} decimal places"
            )));
        }
        match self {
            Transaction::Reward(tx) => {
                if !tx.base.signature_pairs.is_empty() {
                    return Err(BlockchainError::validation(
                        "reward transaction must not be signed",
                    ));
                }
                if !tx.base.fee.is_zero() {
                    return Err(BlockchainError::validation("reward fee must be zero"));
                }
                if tx.rewards.iter().any(Asset::is_negative) {
                    return Err(BlockchainError::validation("reward must not be negative"));
                }
                Ok(())
            }
            Transaction::Transfer(tx) => {
                self.check_signers(&[&tx.from])?;
                if tx.base.fee.symbol() != tx.amount.symbol() {
                    return Err(BlockchainError::validation(
                        "fee symbol must match transfer amount symbol",
                    ));
                }
                if !tx.base.fee.is_positive() {
                    return Err(BlockchainError::validation("fee must be greater than zero"));
                }
                if tx.amount.is_negative() {
                    return Err(BlockchainError::validation(
                        "transfer amount must not be negative",
                    ));
                }
                if tx.memo.as_ref().map_or(0, Vec::len) >= MAX_MEMO_BYTES {
                    return Err(BlockchainError::validation(format!(
                        "memo must be shorter than {MAX_MEMO_BYTES} bytes"
                    )));
                }
                Ok(())
            }
            Transaction::Bond(tx) => {
                if tx.minter == tx.staker {
                    return Err(BlockchainError::validation(
                        "minter and staker must be different keys",
                    ));
                }
                self.check_signers(&[&tx.minter, &tx.staker])?;
                for (name, asset) in [
                    ("stake amount", &tx.stake_amt),
                    ("bond fee", &tx.bond_fee),
                    ("fee", &tx.base.fee),
                ] {
                    if asset.symbol() != AssetSymbol::Gold {
                        return Err(BlockchainError::validation(format!(
                            "{name} must be GOLD"
                        )));
                    }
                }
                if !tx.stake_amt.is_positive() {
                    return Err(BlockchainError::validation(
                        "stake amount must be greater than zero",
                    ));
                }
                if tx.bond_fee.is_negative() || tx.base.fee.is_negative() {
                    return Err(BlockchainError::validation("fees must not be negative"));
                }
                Ok(())
            }
        }
    }

    fn assets(&self) -> Vec<&Asset> {
        let mut assets = vec![self.fee()];
        match self {
            Transaction::Reward(tx) => assets.extend(tx.rewards.iter()),
            Transaction::Transfer(tx) => assets.push(&tx.amount),
            Transaction::Bond(tx) => assets.extend([&tx.stake_amt, &tx.bond_fee]),
        }
        assets
    }

    // Exactly one signature per expected signer, in order, each verifying
    fn check_signers(&self, signers: &[&PublicKey]) -> Result<()> {
        let pairs = self.signature_pairs();
        if pairs.len() != signers.len() {
            return Err(BlockchainError::validation(format!(
                "expected {} signature(s), found {}",
                signers.len(),
                pairs.len()
            )));
        }
        let message = self.unsigned_bytes();
        for (pair, signer) in pairs.iter().zip(signers) {
            if pair.public_key != **signer {
                return Err(BlockchainError::validation(format!(
                    "signature by {} where {} was expected",
                    pair.public_key, signer
                )));
            }
            if !pair.verify(&message) {
                return Err(BlockchainError::validation("signature verification failed"));
            }
        }
        Ok(())
    }
}

impl Encode for Transaction {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_array(self.signature_pairs(), |e, pair| e.write_sig_pair(pair));
        self.encode_unsigned(enc);
    }
}

impl Decode for Transaction {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let signature_pairs = dec.read_array(|d| d.read_sig_pair())?;
        let tx_type = TxType::from_u8(dec.read_u8()?)?;
        let base = TxBase {
            timestamp: dec.read_date()?,
            fee: dec.read_asset()?,
            signature_pairs,
        };
        Ok(match tx_type {
            TxType::Reward => Transaction::Reward(RewardTx {
                base,
                to: dec.read_public_key()?,
                rewards: dec.read_array(|d| d.read_asset())?,
            }),
            TxType::Transfer => Transaction::Transfer(TransferTx {
                base,
                from: dec.read_public_key()?,
                to: dec.read_public_key()?,
                amount: dec.read_asset()?,
                memo: dec.read_bytes()?,
            }),
            TxType::Bond => Transaction::Bond(BondTx {
                base,
                minter: dec.read_public_key()?,
                staker: dec.read_public_key()?,
                stake_amt: dec.read_asset()?,
                bond_fee: dec.read_asset()?,
            }),
        })
    }
}
