//! bincode helpers shared by the shuffle engine and the partition store.

use crate::error::{CommonError, Result};

/// Encode a value with the standard bincode configuration.
pub fn encode<T: bincode::Encode + ?Sized>(value: &T) -> Result<Vec<u8>> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CommonError::serialization_error_with_source("bincode encode failed", e))
}

/// Decode a value written by [`encode`]. Trailing bytes are rejected.
pub fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (value, read) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CommonError::deserialization_error_with_source("bincode decode failed", e))?;
    if read != bytes.len() {
        return Err(CommonError::deserialization_error(format!(
            "{} trailing bytes after decoded value",
            bytes.len() - read
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_vec() {
        let rows: Vec<(String, i64)> = vec![("test2".into(), 3), ("test7".into(), 1)];
        let bytes = encode(&rows).unwrap();
        let decoded: Vec<(String, i64)> = decode(&bytes).unwrap();
        assert_eq!(decoded, rows);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode(&7u32).unwrap();
        bytes.push(0xff);
        assert!(decode::<u32>(&bytes).is_err());
    }

    #[test]
    fn test_decode_truncated_input() {
        let bytes = encode(&"a longer string value".to_string()).unwrap();
        assert!(decode::<String>(&bytes[..3]).is_err());
    }
}
