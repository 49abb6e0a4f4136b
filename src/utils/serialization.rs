// Binary encoding for everything that lands in sled or feeds a content hash
use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};

/// Serialize data using bincode 2.0 with standard configuration
pub fn serialize<T: Serialize + bincode::Encode>(data: &T) -> Result<Vec<u8>> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(data, config)
        .map_err(|e| BlockchainError::Serialization(format!("Serialization failed: {e}")))
}

/// Upper bound on what one decode may allocate. Declared collection lengths
/// are checked against it before any buffer is reserved.
pub const MAX_DECODE_SIZE: usize = 32 * 1024 * 1024;

/// Deserialize data using bincode 2.0 with standard configuration, bounded
/// by `MAX_DECODE_SIZE`.
///
/// Trailing bytes are rejected so a corrupted value is never half-read.
pub fn deserialize<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    let config = bincode::config::standard().with_limit::<MAX_DECODE_SIZE>();
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

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
    struct Entry {
        vout: u64,
        pub_key_hash: Vec<u8>,
    }

    #[test]
    fn test_entries_survive_encoding() {
        let entries = vec![
            Entry {
                vout: 0,
                pub_key_hash: vec![7; 20],
            },
            Entry {
                vout: 3,
                pub_key_hash: vec![9; 20],
            },
        ];

        let bytes = serialize(&entries).expect("Serialization should work");
        let decoded: Vec<Entry> = deserialize(&bytes).expect("Deserialization should work");
        assert_eq!(entries, decoded);
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut bytes = serialize(&42u64).unwrap();
        bytes.push(0);
        let result: Result<u64> = deserialize(&bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_rejects_huge_declared_length() {
        // varint marker 253 followed by a u64 length of 2^40
        let mut bytes = vec![253u8];
        bytes.extend((1u64 << 40).to_le_bytes());
        let result: Result<Vec<u8>> = deserialize(&bytes);
        assert!(matches!(result, Err(BlockchainError::Serialization(_))));

        let mut entries = vec![253u8];
        entries.extend(u64::MAX.to_le_bytes());
        let result: Result<Vec<Entry>> = deserialize(&entries);
        assert!(matches!(result, Err(BlockchainError::Serialization(_))));
    }

    #[test]
    fn test_deserialize_invalid_data() {
        let invalid_bytes = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<Entry> = deserialize(&invalid_bytes);
        assert!(result.is_err());
    }
}
