use ring::digest::{Context, SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};

use crate::error::{BlockchainError, Result};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SEED_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Current wall-clock time truncated to whole seconds
pub fn current_timestamp() -> Result<u64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| BlockchainError::Crypto(format!("System time error: {e}")))?;
    Ok(duration.as_secs())
}

pub fn sha256_digest(data: &[u8]) -> Vec<u8> {
    let mut context = Context::new(&SHA256);
    context.update(data);
    let digest = context.finish();
    digest.as_ref().to_vec()
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = sha256_digest(data);
    let second = sha256_digest(first.as_slice());
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(data: &str) -> Result<Vec<u8>> {
    bs58::decode(data)
        .into_vec()
        .map_err(|e| BlockchainError::InvalidEncoding(format!("Invalid base58 encoding: {e}")))
}

/// Fresh random ed25519 seed
pub fn new_seed() -> Result<[u8; SEED_LEN]> {
    let rng = SystemRandom::new();
    let mut seed = [0u8; SEED_LEN];
    rng.fill(&mut seed)
        .map_err(|e| BlockchainError::Crypto(format!("Failed to generate seed: {e}")))?;
    Ok(seed)
}

/// Derives the public half of an ed25519 key from its seed
pub fn ed25519_public_from_seed(seed: &[u8]) -> Result<[u8; PUBLIC_KEY_LEN]> {
    let key_pair = Ed25519KeyPair::from_seed_unchecked(seed)
        .map_err(|e| BlockchainError::Crypto(format!("Invalid ed25519 seed: {e}")))?;
    let mut public = [0u8; PUBLIC_KEY_LEN];
    public.copy_from_slice(key_pair.public_key().as_ref());
    Ok(public)
}

/// Signs with a 64-byte `seed || public` secret key
pub fn ed25519_sign(secret: &[u8; 64], message: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let key_pair = Ed25519KeyPair::from_seed_and_public_key(&secret[..32], &secret[32..])
        .map_err(|e| BlockchainError::Crypto(format!("Failed to load signing key: {e}")))?;
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(key_pair.sign(message).as_ref());
    Ok(signature)
}

pub fn ed25519_verify(public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let peer_public_key = UnparsedPublicKey::new(&ED25519, public_key);
    peer_public_key.verify(message, signature).is_ok()
}
