//! Key text conversion
//!
//! Configuration files carry keys as standard base64; the device
//! configuration block expects lowercase hex.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::ConfigError;

/// Re-encode a base64 key as hex.
///
/// The decoded length is not checked here; the device rejects keys that are
/// not 32 bytes.
pub fn base64_to_hex(value: &str, field_name: &str) -> Result<String, ConfigError> {
    let bytes = BASE64.decode(value).map_err(|_| ConfigError::InvalidKey {
        field: field_name.to_string(),
    })?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_to_hex_reproduces_raw_bytes() {
        for len in [0usize, 1, 2, 3, 16, 31, 32, 33, 64] {
            let raw: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let encoded = BASE64.encode(&raw);
            assert_eq!(base64_to_hex(&encoded, "TestKey").unwrap(), hex::encode(&raw));
        }
    }

    #[test]
    fn test_known_key() {
        let hex = base64_to_hex("UOvtcWdILFwjb1UnsnK+a9lcqYvNTmtPv+fvqIVOz3w=", "PrivateKey").unwrap();
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with("50ebed71"));
    }

    #[test]
    fn test_invalid_base64() {
        let err = base64_to_hex("invalid-base64!", "PublicKey").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { field } if field == "PublicKey"));
    }
}
