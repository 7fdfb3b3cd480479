//! Random key material and tombstone generation.

use crate::error::CryptoError;
use crate::types::{KEY_LENGTH, TOMBSTONE_PREFIX};

const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Fill a fresh buffer of `len` bytes from the OS RNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CryptoError> {
    let mut buf = vec![0u8; len];
    getrandom::getrandom(&mut buf).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(buf)
}

/// Generate a random alphanumeric key string of exactly [`KEY_LENGTH`] bytes.
///
/// Uses rejection sampling so every character is equally likely.
pub fn generate_key_string() -> Result<String, CryptoError> {
    // Largest multiple of 62 that fits in a byte.
    const LIMIT: u8 = 248;
    let mut out = String::with_capacity(KEY_LENGTH);
    while out.len() < KEY_LENGTH {
        for b in random_bytes(KEY_LENGTH)? {
            if b < LIMIT && out.len() < KEY_LENGTH {
                out.push(ALPHANUMERIC[(b % 62) as usize] as char);
            }
        }
    }
    Ok(out)
}

/// Generate a unique, non-secret placeholder with the byte length of a real key.
pub fn generate_tombstone() -> Result<String, CryptoError> {
    let suffix_len = (KEY_LENGTH - TOMBSTONE_PREFIX.len()) / 2;
    let suffix = hex::encode(random_bytes(suffix_len)?);
    Ok(format!("{TOMBSTONE_PREFIX}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_string_has_key_length() {
        let key = generate_key_string().unwrap();
        assert_eq!(key.len(), KEY_LENGTH);
        assert!(key.bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn key_strings_differ() {
        assert_ne!(generate_key_string().unwrap(), generate_key_string().unwrap());
    }

    #[test]
    fn tombstone_has_key_length() {
        let t = generate_tombstone().unwrap();
        assert_eq!(t.len(), KEY_LENGTH);
        assert!(t.starts_with(TOMBSTONE_PREFIX));
    }

    #[test]
    fn tombstones_are_unique() {
        assert_ne!(generate_tombstone().unwrap(), generate_tombstone().unwrap());
    }
}
