//! Key management
//!
//! Ed25519 key pairs, signature pairs and the checksummed, prefixed text form used for
//! addresses and for minting keys handed to the node in configuration.

pub mod keys;

pub use keys::{
    KeyPair, PrivateKey, PublicKey, SigPair, ADDRESS_CHECK_SUM_LEN, PUB_ADDRESS_PREFIX,
};
