use crate::core::Transaction;
use crate::error::{BlockchainError, Result};
use crate::utils::{double_sha256, Decode, Decoder, Encode, Encoder};
use crate::wallet::{KeyPair, PublicKey, SigPair};
use data_encoding::HEXLOWER;

pub const HASH_LEN: usize = 32;

/// Checks a caller may bypass when replaying history it already trusts.
/// Never used for blocks from an unverified source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFlags(u8);

impl SkipFlags {
    pub const NONE: SkipFlags = SkipFlags(0);
    /// Per-transaction re-validation (shape, signatures, fee minimums)
    pub const SKIP_TX: SkipFlags = SkipFlags(1);
    /// Timestamp freshness of the block and its transactions
    pub const SKIP_TIME: SkipFlags = SkipFlags(1 << 1);
    /// Signer-is-a-bonded-minter check
    pub const SKIP_BOND_SIGNER: SkipFlags = SkipFlags(1 << 2);
    /// Relaxed set used while catching up on network-confirmed history
    pub const SYNC: SkipFlags = SkipFlags(1 | (1 << 1) | (1 << 2));

    pub fn contains(self, other: SkipFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn union(self, other: SkipFlags) -> SkipFlags {
        SkipFlags(self.0 | other.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    height: u64,
    previous_hash: [u8; HASH_LEN],
    timestamp: u64,
    transactions: Vec<Transaction>,
    tx_merkle_root: [u8; HASH_LEN],
}

impl Block {
    pub fn new(
        height: u64,
        previous_hash: [u8; HASH_LEN],
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Block {
        let tx_merkle_root = Self::calc_tx_merkle_root(&transactions);
        Block {
            height,
            previous_hash,
            timestamp,
            transactions,
            tx_merkle_root,
        }
    }

    pub fn get_height(&self) -> u64 {
        self.height
    }

    pub fn get_previous_hash(&self) -> &[u8; HASH_LEN] {
        &self.previous_hash
    }

    pub fn get_timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_tx_merkle_root(&self) -> &[u8; HASH_LEN] {
        &self.tx_merkle_root
    }

    /// doubleSHA256 over the length-prefixed full encoding of each transaction
    pub fn calc_tx_merkle_root(transactions: &[Transaction]) -> [u8; HASH_LEN] {
        let mut enc = Encoder::new();
        for tx in transactions {
            enc.write_bytes(Some(&tx.to_bytes()));
        }
        double_sha256(enc.as_bytes())
    }

    pub fn verify_merkle_root(&self) -> bool {
        Self::calc_tx_merkle_root(&self.transactions) == self.tx_merkle_root
    }

    fn encode_header(&self, enc: &mut Encoder) {
        enc.write_u64(self.height);
        enc.write_fixed(&self.previous_hash);
        enc.write_date(self.timestamp);
        enc.write_fixed(&self.tx_merkle_root);
    }

    /// The bytes a minter signs
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_header(&mut enc);
        enc.into_bytes()
    }

    pub fn sign(self, key_pair: &KeyPair) -> Result<SignedBlock> {
        let sig_pair = key_pair.sign(&self.header_bytes())?;
        Ok(SignedBlock {
            block: self,
            sig_pair,
        })
    }

    /// Integrity checks that need no chain context
    pub fn validate(&self, skip: SkipFlags) -> Result<()> {
        if self.timestamp > u64::from(u32::MAX) {
            return Err(BlockchainError::validation(format!(
                "block {} timestamp does not fit in 32-bit seconds",
                self.height
            )));
        }
        if !self.verify_merkle_root() {
            return Err(BlockchainError::validation(format!(
                "merkle root mismatch in block {}",
                self.height
            )));
        }
        if !skip.contains(SkipFlags::SKIP_TX) {
            for (i, tx) in self.transactions.iter().enumerate() {
                tx.validate().map_err(|e| {
                    BlockchainError::validation(format!(
                        "transaction {i} in block {}: {e}",
                        self.height
                    ))
                })?;
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_transactions_unchecked(&mut self, transactions: Vec<Transaction>) {
        self.transactions = transactions;
    }
}

impl Encode for Block {
    fn encode(&self, enc: &mut Encoder) {
        self.encode_header(enc);
        enc.write_array(&self.transactions, |e, tx| tx.encode(e));
    }
}

impl Decode for Block {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Block {
            height: dec.read_u64()?,
            previous_hash: dec.read_fixed::<HASH_LEN>()?,
            timestamp: dec.read_date()?,
            tx_merkle_root: dec.read_fixed::<HASH_LEN>()?,
            transactions: dec.read_array(Transaction::decode)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignedBlock {
    block: Block,
    sig_pair: SigPair,
}

impl SignedBlock {
    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn get_height(&self) -> u64 {
        self.block.height
    }

    pub fn get_timestamp(&self) -> u64 {
        self.block.timestamp
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.block.get_transactions()
    }

    pub fn signing_key(&self) -> &PublicKey {
        &self.sig_pair.public_key
    }

    pub fn sig_pair(&self) -> &SigPair {
        &self.sig_pair
    }

    /// Hash linking the next block to this one: header plus minter signature
    pub fn hash(&self) -> [u8; HASH_LEN] {
        let mut enc = Encoder::new();
        self.block.encode_header(&mut enc);
        enc.write_sig_pair(&self.sig_pair);
        double_sha256(enc.as_bytes())
    }

    pub fn hash_hex(&self) -> String {
        HEXLOWER.encode(&self.hash())
    }

    pub fn verify_signature(&self) -> bool {
        self.sig_pair.verify(&self.block.header_bytes())
    }

    /// Chain-linkage checks against the block this one claims to extend
    pub fn validate(&self, previous: Option<&SignedBlock>, skip: SkipFlags) -> Result<()> {
        match previous {
            Some(prev) => {
                let expected = prev.get_height() + 1;
                if self.get_height() != expected {
                    return Err(BlockchainError::HeightMismatch {
                        expected,
                        got: self.get_height(),
                    });
                }
                if self.block.previous_hash != prev.hash() {
                    return Err(BlockchainError::validation(format!(
                        "previous hash mismatch at height {}",
                        self.get_height()
                    )));
                }
            }
            None => {
                if self.get_height() != 0 {
                    return Err(BlockchainError::HeightMismatch {
                        expected: 0,
                        got: self.get_height(),
                    });
                }
                if self.block.previous_hash != [0u8; HASH_LEN] {
                    return Err(BlockchainError::validation(
                        "genesis block must have an empty previous hash",
                    ));
                }
            }
        }
        if !self.verify_signature() {
            return Err(BlockchainError::validation(format!(
                "invalid block signature at height {}",
                self.get_height()
            )));
        }
        self.block.validate(skip)
    }
}

impl Encode for SignedBlock {
    fn encode(&self, enc: &mut Encoder) {
        self.block.encode(enc);
        enc.write_sig_pair(&self.sig_pair);
    }
}

impl Decode for SignedBlock {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(SignedBlock {
            block: Block::decode(dec)?,
            sig_pair: dec.read_sig_pair()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Asset;

    fn asset(s: &str) -> Asset {
        s.parse().unwrap()
    }

    fn sample_transactions(from: &KeyPair, to: &KeyPair) -> Vec<Transaction> {
        let mut transfer = Transaction::new_transfer(
            *from.public_key(),
            *to.public_key(),
            asset("2 GOLD"),
            asset("0.01 GOLD"),
            None,
            1_700_000_000,
        );
        transfer.sign(from).unwrap();
        let reward = Transaction::new_reward(
            *from.public_key(),
            vec![asset("0.01 GOLD")],
            1_700_000_000,
        );
        vec![transfer, reward]
    }

    #[test]
    fn test_signed_block_round_trip() {
        let minter = KeyPair::generate().unwrap();
        let to = KeyPair::generate().unwrap();
        let block = Block::new(3, [7u8; HASH_LEN], 1_700_000_003, sample_transactions(&minter, &to));
        let signed = block.sign(&minter).unwrap();

        let bytes = signed.to_bytes();
        let decoded = SignedBlock::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(decoded.to_bytes(), bytes);
        assert!(decoded.verify_signature());
        assert_eq!(decoded.hash(), signed.hash());
    }

    #[test]
    fn test_tx_root_hashes_concatenated_encodings() {
        let minter = KeyPair::generate().unwrap();
        let to = KeyPair::generate().unwrap();
        let txs = sample_transactions(&minter, &to);

        let mut concatenated = Vec::new();
        for tx in &txs {
            let bytes = tx.to_bytes();
            concatenated.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            concatenated.extend_from_slice(&bytes);
        }
        assert_eq!(Block::calc_tx_merkle_root(&txs), double_sha256(&concatenated));

        // order matters, no pairwise tree
        let reversed: Vec<Transaction> = txs.iter().rev().cloned().collect();
        assert_ne!(Block::calc_tx_merkle_root(&reversed), Block::calc_tx_merkle_root(&txs));
        assert_eq!(Block::calc_tx_merkle_root(&[]), double_sha256(&[]));
    }

    #[test]
    fn test_merkle_root_mismatch_fails_validation() {
        let minter = KeyPair::generate().unwrap();
        let to = KeyPair::generate().unwrap();
        let mut block = Block::new(1, [0u8; HASH_LEN], 1_700_000_000, sample_transactions(&minter, &to));
        block.validate(SkipFlags::NONE).unwrap();

        block.set_transactions_unchecked(vec![]);
        assert!(!block.verify_merkle_root());
        assert!(matches!(
            block.validate(SkipFlags::SYNC),
            Err(BlockchainError::Validation(_))
        ));
    }

    #[test]
    fn test_previous_hash_and_height_linkage() {
        let minter = KeyPair::generate().unwrap();
        let genesis = Block::new(0, [0u8; HASH_LEN], 1_700_000_000, vec![])
            .sign(&minter)
            .unwrap();
        genesis.validate(None, SkipFlags::NONE).unwrap();

        let next = Block::new(1, genesis.hash(), 1_700_000_003, vec![])
            .sign(&minter)
            .unwrap();
        next.validate(Some(&genesis), SkipFlags::NONE).unwrap();

        let wrong_prev = Block::new(1, [9u8; HASH_LEN], 1_700_000_003, vec![])
            .sign(&minter)
            .unwrap();
        assert!(matches!(
            wrong_prev.validate(Some(&genesis), SkipFlags::NONE),
            Err(BlockchainError::Validation(_))
        ));

        let skipped = Block::new(2, genesis.hash(), 1_700_000_003, vec![])
            .sign(&minter)
            .unwrap();
        assert_eq!(
            skipped.validate(Some(&genesis), SkipFlags::NONE),
            Err(BlockchainError::HeightMismatch {
                expected: 1,
                got: 2
            })
        );
    }

    #[test]
    fn test_tampered_header_breaks_signature() {
        let minter = KeyPair::generate().unwrap();
        let signed = Block::new(0, [0u8; HASH_LEN], 1_700_000_000, vec![])
            .sign(&minter)
            .unwrap();
        let mut bytes = signed.to_bytes();
        // timestamp lives right after height and previous hash
        bytes[8 + HASH_LEN + 3] ^= 0x01;
        let tampered = SignedBlock::from_bytes(&bytes).unwrap();
        assert!(!tampered.verify_signature());
    }

    #[test]
    fn test_skip_flags() {
        assert!(SkipFlags::SYNC.contains(SkipFlags::SKIP_TX));
        assert!(SkipFlags::SYNC.contains(SkipFlags::SKIP_BOND_SIGNER));
        assert!(!SkipFlags::NONE.contains(SkipFlags::SKIP_TIME));
        assert!(!SkipFlags::SKIP_TX.contains(SkipFlags::NONE));
        assert!(SkipFlags::SKIP_TX
            .union(SkipFlags::SKIP_TIME)
            .contains(SkipFlags::SKIP_TIME));
    }
}
