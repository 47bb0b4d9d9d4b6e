use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::error::VaultError;

const MAX_KEY_LEN: usize = 1024;

/// Checks every share before any of them is sent to Vault.
pub fn validate_key_shares(keys: &[String]) -> Result<(), VaultError> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (index, key) in keys.iter().enumerate() {
        validate_key_share(index, key)?;
        if let Some(first) = seen.insert(key.as_str(), index) {
            return Err(VaultError::InvalidKey {
                index,
                reason: format!("duplicate of share at index {first}"),
            });
        }
    }
    Ok(())
}

pub fn validate_key_share(index: usize, key: &str) -> Result<(), VaultError> {
    let invalid = |reason: String| VaultError::InvalidKey { index, reason };
    if key.is_empty() {
        return Err(invalid("key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(invalid(format!(
            "key length {} exceeds maximum {MAX_KEY_LEN}",
            key.len()
        )));
    }
    // never echo the key itself, only the decoder's complaint
    let decoded = STANDARD
        .decode(key)
        .map_err(|e| invalid(format!("invalid base64 encoding: {e}")))?;
    if decoded.is_empty() {
        return Err(invalid("decoded key is empty".into()));
    }
    if decoded.iter().all(|b| *b == 0) {
        return Err(invalid("key cannot be all zeros".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        STANDARD.encode(s)
    }

    #[test]
    fn accepts_distinct_base64_shares() {
        let keys = vec![b64("share-one"), b64("share-two"), b64("share-three")];
        assert!(validate_key_shares(&keys).is_ok());
    }

    #[test]
    fn empty_share_list_is_valid() {
        assert!(validate_key_shares(&[]).is_ok());
    }

    #[test]
    fn rejects_bad_encoding_with_index() {
        let keys = vec![b64("fine"), "not base64!".to_string()];
        match validate_key_shares(&keys) {
            Err(VaultError::InvalidKey { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("base64"));
                assert!(!reason.contains("not base64!"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_all_zero_and_empty_shares() {
        let zeros = STANDARD.encode([0u8; 16]);
        assert!(validate_key_share(0, &zeros).is_err());
        assert!(validate_key_share(0, "").is_err());
        assert!(validate_key_share(0, &"A".repeat(MAX_KEY_LEN + 4)).is_err());
    }

    #[test]
    fn rejects_duplicate_shares() {
        let keys = vec![b64("same"), b64("other"), b64("same")];
        match validate_key_shares(&keys) {
            Err(VaultError::InvalidKey { index, reason }) => {
                assert_eq!(index, 2);
                assert!(reason.contains("index 0"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
