//! Content hashing.
//!
//! Every id derived from content (hook ids, impulse signatures) goes through
//! SHA-256 and is rendered as 64 lowercase hex characters.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Width of every hash produced by this module, in characters.
pub const HASH_LENGTH: usize = 64;

/// Hash raw bytes.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash an ordered list of string parts.
///
/// Parts are length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
#[must_use]
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Hash the JSON serialization of a value.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_fixed_width() {
        assert_eq!(hash_bytes(b"").len(), HASH_LENGTH);
        assert_eq!(hash_bytes(&[0u8; 4096]).len(), HASH_LENGTH);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let value = json!({"entity": "app", "channel": "events"});
        assert_eq!(content_hash(&value).unwrap(), content_hash(&value).unwrap());
        assert_ne!(
            content_hash(&value).unwrap(),
            content_hash(&json!({"entity": "app"})).unwrap()
        );
    }

    #[test]
    fn test_fingerprint_separates_parts() {
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
        assert_eq!(fingerprint(&["a", "b"]), fingerprint(&["a", "b"]));
    }
}
