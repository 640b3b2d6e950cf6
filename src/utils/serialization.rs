// Bincode helpers for non-consensus data: peer RPC frames and index values.
// Consensus bytes (transactions, blocks) go through `codec` instead.
use crate::error::{BlockchainError, Result};

/// Serialize data using bincode 2.0 with standard configuration
pub fn serialize<T: bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Deserialize data using bincode 2.0 with standard configuration
pub fn deserialize<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    let config = bincode::config::standard();
    let (data, read) = bincode::decode_from_slice(bytes, config)
        .map_err(|e| BlockchainError::Serialization(format!("Deserialization failed: {e}")))?;
    if read != bytes.len() {
        return Err(BlockchainError::Serialization(format!(
            "Deserialization left {} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
    struct BalanceRecord {
        gold: String,
        silver: String,
    }

    #[test]
    fn test_serialize_deserialize() {
        let original = BalanceRecord {
            gold: "1.00 GOLD".to_string(),
            silver: "0 SILVER".to_string(),
        };

        let serialized = serialize(&original).expect("Serialization should work");
        let deserialized: BalanceRecord =
            deserialize(&serialized).expect("Deserialization should work");

        assert_eq!(original, deserialized);
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut bytes = serialize(&7u32).unwrap();
        bytes.push(0);
        let result: Result<u32> = deserialize(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_invalid_data() {
        let invalid_bytes = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<BalanceRecord> = deserialize(&invalid_bytes);
        assert!(result.is_err());
    }
}
