use crate::error::{BlockchainError, Result};
use crate::utils::crypto::{
    base58_decode, base58_encode, double_sha256, ed25519_public_from_seed, ed25519_sign,
    ed25519_verify, new_seed, PUBLIC_KEY_LEN, SEED_LEN, SIGNATURE_LEN,
};
use data_encoding::HEXLOWER;
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Human-readable prefix in front of every public key string
pub const PUB_ADDRESS_PREFIX: &str = "AUR";
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;

const PRIV_BUF_PREFIX: u8 = 0x01;
const PUB_BUF_PREFIX: u8 = 0x02;
const SECRET_KEY_LEN: usize = 64;

fn checksum(payload: &[u8]) -> [u8; ADDRESS_CHECK_SUM_LEN] {
    let digest = double_sha256(payload);
    let mut out = [0u8; ADDRESS_CHECK_SUM_LEN];
    out.copy_from_slice(&digest[..ADDRESS_CHECK_SUM_LEN]);
    out
}

// prefix || key bytes || checksum
fn encode_wif(prefix: u8, key_bytes: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + key_bytes.len() + ADDRESS_CHECK_SUM_LEN);
    payload.push(prefix);
    payload.extend_from_slice(key_bytes);
    let checksum = checksum(&payload);
    payload.extend_from_slice(&checksum);
    let encoded = base58_encode(&payload);
    payload.zeroize();
    encoded
}

fn decode_wif(prefix: u8, text: &str) -> Result<Vec<u8>> {
    let payload = base58_decode(text)?;
    if payload.len() < 1 + ADDRESS_CHECK_SUM_LEN {
        return Err(BlockchainError::InvalidEncoding("key too short".to_string()));
    }
    let (body, actual) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if checksum(body) != actual {
        return Err(BlockchainError::InvalidEncoding(
            "checksum mismatch".to_string(),
        ));
    }
    if body[0] != prefix {
        return Err(BlockchainError::InvalidEncoding(format!(
            "unexpected key prefix byte {:#04x}",
            body[0]
        )));
    }
    Ok(body[1..].to_vec())
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> PublicKey {
        PublicKey(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<PublicKey> {
        let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
            BlockchainError::InvalidEncoding(format!("public key must be {PUBLIC_KEY_LEN} bytes"))
        })?;
        Ok(PublicKey(raw))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_wif(&self) -> String {
        format!("{PUB_ADDRESS_PREFIX}{}", encode_wif(PUB_BUF_PREFIX, &self.0))
    }

    pub fn from_wif(text: &str) -> Result<PublicKey> {
        let body = text.strip_prefix(PUB_ADDRESS_PREFIX).ok_or_else(|| {
            BlockchainError::InvalidEncoding(format!(
                "address must start with {PUB_ADDRESS_PREFIX}"
            ))
        })?;
        PublicKey::from_slice(&decode_wif(PUB_BUF_PREFIX, body)?)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        ed25519_verify(&self.0, signature, message)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wif())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_wif())
    }
}

impl FromStr for PublicKey {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        PublicKey::from_wif(s)
    }
}

/// A 64-byte `seed || public` ed25519 secret, optionally carrying its seed separately
/// ("extended" form, produced by generation or seed restore).
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey {
    key: [u8; SECRET_KEY_LEN],
    seed: Option<[u8; SEED_LEN]>,
}

impl PrivateKey {
    pub fn from_seed(seed: [u8; SEED_LEN]) -> Result<PrivateKey> {
        let public = ed25519_public_from_seed(&seed)?;
        let mut key = [0u8; SECRET_KEY_LEN];
        key[..SEED_LEN].copy_from_slice(&seed);
        key[SEED_LEN..].copy_from_slice(&public);
        Ok(PrivateKey {
            key,
            seed: Some(seed),
        })
    }

    /// Loads a bare 64-byte secret; fails if its halves do not belong together
    pub fn from_secret(key: [u8; SECRET_KEY_LEN]) -> Result<PrivateKey> {
        let public = ed25519_public_from_seed(&key[..SEED_LEN])
            .map_err(|e| BlockchainError::InvalidEncoding(e.to_string()))?;
        if public[..] != key[SEED_LEN..] {
            return Err(BlockchainError::InvalidEncoding(
                "secret key does not match its public half".to_string(),
            ));
        }
        Ok(PrivateKey { key, seed: None })
    }

    pub fn is_extended(&self) -> bool {
        self.seed.is_some()
    }

    pub fn seed(&self) -> Option<&[u8; SEED_LEN]> {
        self.seed.as_ref()
    }

    pub fn public_key(&self) -> PublicKey {
        let mut public = [0u8; PUBLIC_KEY_LEN];
        public.copy_from_slice(&self.key[SEED_LEN..]);
        PublicKey(public)
    }

    pub fn sign(&self, message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
        ed25519_sign(&self.key, message)
    }

    pub fn to_wif(&self) -> String {
        match &self.seed {
            Some(seed) => {
                let mut bytes = [0u8; SECRET_KEY_LEN + SEED_LEN];
                bytes[..SECRET_KEY_LEN].copy_from_slice(&self.key);
                bytes[SECRET_KEY_LEN..].copy_from_slice(seed);
                let wif = encode_wif(PRIV_BUF_PREFIX, &bytes);
                bytes.zeroize();
                wif
            }
            None => encode_wif(PRIV_BUF_PREFIX, &self.key),
        }
    }

    pub fn from_wif(text: &str) -> Result<PrivateKey> {
        let mut bytes = decode_wif(PRIV_BUF_PREFIX, text)?;
        let result = match bytes.len() {
            SECRET_KEY_LEN => {
                let mut key = [0u8; SECRET_KEY_LEN];
                key.copy_from_slice(&bytes);
                PrivateKey::from_secret(key)
            }
            n if n == SECRET_KEY_LEN + SEED_LEN => {
                let mut key = [0u8; SECRET_KEY_LEN];
                key.copy_from_slice(&bytes[..SECRET_KEY_LEN]);
                let mut seed = [0u8; SEED_LEN];
                seed.copy_from_slice(&bytes[SECRET_KEY_LEN..]);
                if key[..SEED_LEN] != seed {
                    Err(BlockchainError::InvalidEncoding(
                        "seed does not match secret key".to_string(),
                    ))
                } else {
                    PrivateKey::from_secret(key).map(|mut k| {
                        k.seed = Some(seed);
                        k
                    })
                }
            }
            n => Err(BlockchainError::InvalidEncoding(format!(
                "private key payload has invalid length {n}"
            ))),
        };
        bytes.zeroize();
        result
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({}, <redacted>)", self.public_key())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct SigPair {
    pub public_key: PublicKey,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SigPair {
    pub fn verify(&self, message: &[u8]) -> bool {
        self.public_key.verify(message, &self.signature)
    }
}

impl fmt::Debug for SigPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SigPair({}, {})",
            self.public_key,
            HEXLOWER.encode(&self.signature)
        )
    }
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    public: PublicKey,
    private: PrivateKey,
}

impl KeyPair {
    pub fn generate() -> Result<KeyPair> {
        let private = PrivateKey::from_seed(new_seed()?)?;
        Ok(KeyPair::from_private(private))
    }

    pub fn from_private(private: PrivateKey) -> KeyPair {
        KeyPair {
            public: private.public_key(),
            private,
        }
    }

    pub fn from_wif(text: &str) -> Result<KeyPair> {
        Ok(KeyPair::from_private(PrivateKey::from_wif(text)?))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    pub fn sign(&self, message: &[u8]) -> Result<SigPair> {
        Ok(SigPair {
            public_key: self.public,
            signature: self.private.sign(message)?,
        })
    }
}
