//! String-level encrypt/decrypt over a [`KeyRing`].

use tracing::info;

use crate::envelope::{Envelope, CIPHER_AES_256_GCM};
use crate::error::{RekeyError, Result};
use crate::hasher::KeyedHasher;
use crate::keyring::{KeyAccess, KeyRing};

/// Encrypt/decrypt seam consumed by the walkers, the scanner and the reporter.
pub trait SecretCipher {
    /// Version new ciphertext is produced with.
    fn latest_version(&self) -> u32;

    /// Encrypt `plaintext` under the latest key, returning an envelope string.
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    /// Decrypt an envelope string with the key its version names.
    fn decrypt(&self, ciphertext: &str) -> Result<String>;

    /// Decrypt then encrypt under the latest key.
    fn reencrypt(&self, ciphertext: &str) -> Result<String> {
        let plaintext = self.decrypt(ciphertext)?;
        self.encrypt(&plaintext)
    }
}

/// Legacy-decrypt audit settings.
///
/// When enabled, decrypts are reported on the `rekey::audit` tracing target
/// so operators can find callers still reading old ciphertext before keys
/// are invalidated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecryptAudit {
    pub enabled: bool,
    /// Skip values already under the latest key.
    pub only_old_keys: bool,
}

/// [`SecretCipher`] backed by a borrowed key ring.
pub struct Encryptor<'r> {
    ring: &'r KeyRing,
    audit: DecryptAudit,
    context: &'static str,
}

impl<'r> Encryptor<'r> {
    pub fn new(ring: &'r KeyRing) -> Self {
        Self {
            ring,
            audit: DecryptAudit::default(),
            context: "rekey",
        }
    }

    pub fn with_audit(mut self, audit: DecryptAudit) -> Self {
        self.audit = audit;
        self
    }

    /// Label reported with audited decrypts.
    pub fn with_context(mut self, context: &'static str) -> Self {
        self.context = context;
        self
    }

    pub fn ring(&self) -> &KeyRing {
        self.ring
    }

    fn audit_decrypt(&self, ciphertext: &str, key_version: u32) {
        // Anything shorter cannot be a real `v:c:payload`.
        if !self.audit.enabled || ciphertext.len() <= 5 {
            return;
        }
        let latest = self.ring.latest_version();
        if self.audit.only_old_keys && key_version == latest {
            return;
        }
        info!(
            target: "rekey::audit",
            key_version,
            latest,
            context = self.context,
            "legacy decryption"
        );
    }
}

impl SecretCipher for Encryptor<'_> {
    fn latest_version(&self) -> u32 {
        self.ring.latest_version()
    }

    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(self.ring.encrypt(plaintext.as_bytes())?.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let envelope = Envelope::parse(ciphertext)?;
        self.audit_decrypt(ciphertext, envelope.key_version);
        if envelope.cipher_version != CIPHER_AES_256_GCM {
            return Err(RekeyError::DecryptionFailure {
                key_version: envelope.key_version,
                reason: format!("unsupported cipher version {}", envelope.cipher_version),
            });
        }
        let plaintext = self
            .ring
            .decrypt_with(envelope.key_version, &envelope.payload)?;
        String::from_utf8(plaintext).map_err(|_| RekeyError::DecryptionFailure {
            key_version: envelope.key_version,
            reason: "plaintext is not valid UTF-8".into(),
        })
    }
}

impl KeyedHasher for Encryptor<'_> {
    fn key_version(&self) -> u32 {
        self.ring.latest_version()
    }

    fn hash(&self, data: &str) -> Result<String> {
        let key = self.ring.key_for(self.ring.latest_version(), KeyAccess::Crypt)?;
        Ok(rekey_crypto::keyed_hash(key.as_bytes(), data.as_bytes())?)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::keyring::KeyMaterial;
    use rekey_crypto::KEY_LENGTH;

    /// Ring of `n` deterministic keys: `aaaa…`, `bbbb…`, …
    pub fn ring(n: usize) -> KeyRing {
        KeyRing::new(
            (0..n)
                .map(|i| {
                    let c = (b'a' + i as u8) as char;
                    KeyMaterial::new(c.to_string().repeat(KEY_LENGTH)).unwrap()
                })
                .collect(),
        )
        .unwrap()
    }

    /// Ciphertext of `plaintext` under `version` of a ring built by [`ring`].
    pub fn encrypt_at(version: usize, plaintext: &str) -> String {
        let old = ring(version + 1);
        Encryptor::new(&old).encrypt(plaintext).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{encrypt_at, ring};
    use super::*;

    #[test]
    fn round_trip_under_latest() {
        let ring = ring(3);
        let enc = Encryptor::new(&ring);
        for plaintext in ["", "x", "card 4111 1111 1111 1111", "ünïcödé"] {
            let c = enc.encrypt(plaintext).unwrap();
            assert!(c.starts_with("2:1:"));
            assert_eq!(enc.decrypt(&c).unwrap(), plaintext);
        }
    }

    #[test]
    fn decrypts_old_versions() {
        let ring = ring(3);
        let enc = Encryptor::new(&ring);
        assert_eq!(enc.decrypt(&encrypt_at(0, "zero")).unwrap(), "zero");
        assert_eq!(enc.decrypt(&encrypt_at(1, "one")).unwrap(), "one");
    }

    #[test]
    fn reencrypt_moves_to_latest() {
        let ring = ring(2);
        let enc = Encryptor::new(&ring);
        let new = enc.reencrypt(&encrypt_at(0, "secret")).unwrap();
        assert!(new.starts_with("1:1:"));
        assert_eq!(enc.decrypt(&new).unwrap(), "secret");
    }

    #[test]
    fn plaintext_is_malformed_envelope() {
        let ring = ring(1);
        assert!(matches!(
            Encryptor::new(&ring).decrypt("not encrypted"),
            Err(RekeyError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn unknown_cipher_version_fails() {
        let ring = ring(1);
        let enc = Encryptor::new(&ring);
        let c = enc.encrypt("x").unwrap();
        let bumped = c.replacen("0:1:", "0:9:", 1);
        assert!(matches!(
            enc.decrypt(&bumped),
            Err(RekeyError::DecryptionFailure { key_version: 0, .. })
        ));
    }

    #[test]
    fn invalidated_version_fails() {
        let mut ring = ring(2);
        let old = encrypt_at(0, "x");
        ring.invalidate_all_but_latest().unwrap();
        assert!(matches!(
            Encryptor::new(&ring).decrypt(&old),
            Err(RekeyError::InvalidatedKeyUsed(0))
        ));
    }

    #[test]
    fn audit_does_not_change_result() {
        let ring = ring(2);
        let enc = Encryptor::new(&ring)
            .with_audit(DecryptAudit {
                enabled: true,
                only_old_keys: true,
            })
            .with_context("test");
        assert_eq!(enc.decrypt(&encrypt_at(0, "audited")).unwrap(), "audited");
    }

    #[test]
    fn hash_uses_latest_key() {
        let ring = ring(2);
        let enc = Encryptor::new(&ring);
        assert_eq!(enc.key_version(), 1);
        assert_eq!(enc.hash("x").unwrap(), enc.hash("x").unwrap());
    }
}
