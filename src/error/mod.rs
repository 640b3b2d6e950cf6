//! Error handling for the node
//!
//! Every fallible operation in the crate returns [`Result`]. Validation failures are
//! recovered by the caller (the offending transaction or block is dropped), transient
//! network conditions are retried, and storage corruption propagates to the process.

use std::fmt;

/// Result type alias for blockchain operations
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Error taxonomy for ledger, storage and network operations
#[derive(Debug, Clone, PartialEq)]
pub enum BlockchainError {
    /// Malformed or unauthenticated transaction or block
    Validation(String),
    /// Transaction is already known to the dedup index
    DuplicateTransaction,
    /// Account cannot cover the debits of a transaction
    InsufficientBalance { required: String, available: String },
    /// Asset arithmetic across different symbols
    AssetTypeMismatch,
    /// Asset division by a zero amount
    DivideByZero,
    /// Bad key/address text form or unparsable asset string
    InvalidEncoding(String),
    /// Block does not extend the current head
    HeightMismatch { expected: u64, got: u64 },
    /// Block signed by a key that is not allowed to mint it
    InvalidSigner(String),
    /// Block log checksum failure; never repaired automatically
    CorruptStore(String),
    /// Peer connection closed while a request was outstanding
    Disconnected,
    /// Every peer in the pool failed the request
    EndOfClients,
    /// Error returned by a remote peer for an RPC request
    Rpc { code: String, message: String },
    /// Database-related errors
    Database(String),
    /// Serialization/deserialization errors
    Serialization(String),
    /// File I/O errors
    Io(String),
    /// Network communication errors
    Network(String),
    /// Cryptographic operation errors
    Crypto(String),
    /// Configuration errors
    Config(String),
}

impl BlockchainError {
    /// Transient network conditions, retried by failover or backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BlockchainError::Disconnected
                | BlockchainError::EndOfClients
                | BlockchainError::Network(_)
        )
    }

    /// Errors that must reach the operator instead of being swallowed
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BlockchainError::CorruptStore(_) | BlockchainError::Database(_) | BlockchainError::Io(_)
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BlockchainError::Validation(msg.into())
    }
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockchainError::Validation(msg) => write!(f, "Validation error: {msg}"),
            BlockchainError::DuplicateTransaction => write!(f, "Duplicate transaction"),
            BlockchainError::InsufficientBalance {
                required,
                available,
            } => {
                write!(
                    f,
                    "Insufficient balance: required {required}, available {available}"
                )
            }
            BlockchainError::AssetTypeMismatch => write!(f, "Asset type mismatch"),
            BlockchainError::DivideByZero => write!(f, "Divide by zero"),
            BlockchainError::InvalidEncoding(msg) => write!(f, "Invalid encoding: {msg}"),
            BlockchainError::HeightMismatch { expected, got } => {
                write!(f, "Height mismatch: expected {expected}, got {got}")
            }
            BlockchainError::InvalidSigner(msg) => write!(f, "Invalid signer: {msg}"),
            BlockchainError::CorruptStore(msg) => write!(f, "Corrupt block store: {msg}"),
            BlockchainError::Disconnected => write!(f, "Peer disconnected"),
            BlockchainError::EndOfClients => write!(f, "No more peers to try"),
            BlockchainError::Rpc { code, message } => write!(f, "Peer error {code}: {message}"),
            BlockchainError::Database(msg) => write!(f, "Database error: {msg}"),
            BlockchainError::Serialization(msg) => write!(f, "Serialization error: {msg}"),
            BlockchainError::Io(msg) => write!(f, "I/O error: {msg}"),
            BlockchainError::Network(msg) => write!(f, "Network error: {msg}"),
            BlockchainError::Crypto(msg) => write!(f, "Cryptographic error: {msg}"),
            BlockchainError::Config(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<std::io::Error> for BlockchainError {
    fn from(err: std::io::Error) -> Self {
        BlockchainError::Io(err.to_string())
    }
}

impl From<sled::Error> for BlockchainError {
    fn from(err: sled::Error) -> Self {
        BlockchainError::Database(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for BlockchainError {
    fn from(err: bincode::error::EncodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for BlockchainError {
    fn from(err: bincode::error::DecodeError) -> Self {
        BlockchainError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_and_fatal_classification() {
        assert!(BlockchainError::Disconnected.is_transient());
        assert!(BlockchainError::EndOfClients.is_transient());
        assert!(!BlockchainError::DuplicateTransaction.is_transient());

        assert!(BlockchainError::CorruptStore("bad checksum".to_string()).is_fatal());
        assert!(!BlockchainError::validation("bad tx").is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = BlockchainError::HeightMismatch {
            expected: 2,
            got: 3,
        };
        assert_eq!(err.to_string(), "Height mismatch: expected 2, got 3");

        let err = BlockchainError::InsufficientBalance {
            required: "10 GOLD".to_string(),
            available: "9 GOLD".to_string(),
        };
        assert!(err.to_string().contains("required 10 GOLD"));
    }
}
