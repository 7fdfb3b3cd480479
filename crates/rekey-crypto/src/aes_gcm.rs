//! AES-256-GCM sealing.
//!
//! Sealed wire format: [12 bytes: IV][N bytes: ciphertext + tag]
//! Key and cipher versions are carried by the caller's envelope, not here.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::random::random_bytes;
use crate::types::{AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, KEY_LENGTH};

fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LENGTH,
            got: key.len(),
        });
    }
    Ok(())
}

/// Generate a random 12-byte IV for AES-GCM.
pub fn generate_iv() -> Result<[u8; AES_GCM_IV_LENGTH], CryptoError> {
    let mut iv = [0u8; AES_GCM_IV_LENGTH];
    getrandom::getrandom(&mut iv).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(iv)
}

/// AES-256-GCM cipher bound to one key.
///
/// Built once per key slot so that re-encrypting a large batch does not
/// re-run the key schedule for every value.
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    /// Create a sealer from 32 bytes of raw key material.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        check_key(key)?;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Seal `plaintext`, returning [IV][ciphertext+tag].
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = generate_iv()?;
        let nonce = Nonce::from_slice(&iv);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(iv.len() + ciphertext.len());
        result.extend_from_slice(&iv);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Open a sealed blob produced by [`Sealer::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < AES_GCM_IV_LENGTH + AES_GCM_TAG_LENGTH {
            return Err(CryptoError::DataTooShort);
        }
        let (iv, ciphertext) = sealed.split_at(AES_GCM_IV_LENGTH);
        self.cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

/// One-shot seal with a raw key.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Sealer::new(key)?.seal(plaintext)
}

/// One-shot open with a raw key.
pub fn open(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    Sealer::new(key)?.open(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&random_bytes(32).unwrap());
        key
    }

    #[test]
    fn seal_open_round_trip() {
        let key = random_key();
        let sealer = Sealer::new(&key).unwrap();
        let sealed = sealer.seal(b"Hello, World!").unwrap();
        assert_eq!(sealer.open(&sealed).unwrap(), b"Hello, World!");
    }

    #[test]
    fn different_ciphertext_each_time() {
        let key = random_key();
        let a = seal(&key, b"test").unwrap();
        let b = seal(&key, b"test").unwrap();
        assert_ne!(a, b);
        assert_eq!(open(&key, &a).unwrap(), b"test");
        assert_eq!(open(&key, &b).unwrap(), b"test");
    }

    #[test]
    fn sealed_layout() {
        let key = random_key();
        let sealed = seal(&key, &[1, 2, 3]).unwrap();
        assert_eq!(sealed.len(), AES_GCM_IV_LENGTH + 3 + AES_GCM_TAG_LENGTH);
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = random_key();
        let mut sealed = seal(&key, b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn rejects_truncated_data() {
        let key = random_key();
        let err = open(&key, &[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn rejects_wrong_key_length() {
        let err = Sealer::new(&[0u8; 16]).err().unwrap();
        assert!(matches!(
            err,
            CryptoError::InvalidKeyLength {
                expected: 32,
                got: 16
            }
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&random_key(), b"secret").unwrap();
        assert!(open(&random_key(), &sealed).is_err());
    }

    #[test]
    fn handles_empty_plaintext() {
        let key = random_key();
        let sealed = seal(&key, b"").unwrap();
        assert!(open(&key, &sealed).unwrap().is_empty());
    }
}
