//! Utility functions and helpers
//!
//! Hashing, key primitives, clocks, the consensus codec and the bincode helpers
//! used for everything that is not consensus data.

pub mod codec;
pub mod crypto;
pub mod serialization;

pub use codec::{Decode, Decoder, Encode, Encoder, MAX_ASSET_STR_LEN};
pub use crypto::{
    base58_decode, base58_encode, current_timestamp, double_sha256, ed25519_public_from_seed,
    ed25519_sign, ed25519_verify, new_seed, sha256_digest,
};
pub use serialization::{deserialize, serialize};
