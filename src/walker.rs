//! Structural re-encryption.
//! Recursively walks a JSON value and re-encrypts every stale ciphertext scalar.
//!
//! Maps keep their key order (`serde_json` is built with `preserve_order`),
//! sequences keep their element order, and scalars that are not stale
//! ciphertext are left byte-for-byte untouched. Input is assumed acyclic,
//! which every deserialized document is.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::encryptor::SecretCipher;
use crate::envelope::{is_current, looks_like_ciphertext};

/// Counters for one walker instance, accumulated across walks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WalkStats {
    pub reencrypted: usize,
    pub skipped_current: usize,
    pub failures: usize,
}

/// Re-encrypts ciphertext found anywhere inside nested maps and sequences.
///
/// Undecryptable values are kept as their original ciphertext and counted;
/// a bad value never stops its siblings from being processed.
pub struct StructuralReencryptor<'c, C: SecretCipher + ?Sized> {
    cipher: &'c C,
    stats: WalkStats,
}

impl<'c, C: SecretCipher + ?Sized> StructuralReencryptor<'c, C> {
    pub fn new(cipher: &'c C) -> Self {
        Self {
            cipher,
            stats: WalkStats::default(),
        }
    }

    /// Walk `value` and return it with every stale ciphertext re-encrypted.
    pub fn walk(&mut self, mut value: Value) -> Value {
        self.walk_in_place(&mut value);
        value
    }

    /// In-place variant of [`walk`](Self::walk).
    pub fn walk_in_place(&mut self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (_, child) in map.iter_mut() {
                    self.walk_in_place(child);
                }
            }
            Value::Array(items) => {
                for child in items.iter_mut() {
                    self.walk_in_place(child);
                }
            }
            Value::String(s) => self.visit_scalar(s),
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
    }

    fn visit_scalar(&mut self, s: &mut String) {
        if !looks_like_ciphertext(s) {
            return;
        }
        if is_current(s, self.cipher.latest_version()) {
            self.stats.skipped_current += 1;
            return;
        }
        match self.cipher.decrypt(s) {
            // An empty plaintext is the primitive's failure signal as well.
            Ok(plaintext) if !plaintext.is_empty() => match self.cipher.encrypt(&plaintext) {
                Ok(reencrypted) => {
                    debug!("re-encrypted nested value");
                    *s = reencrypted;
                    self.stats.reencrypted += 1;
                }
                Err(e) => {
                    warn!(error = %e, "re-encryption failed, keeping original ciphertext");
                    self.stats.failures += 1;
                }
            },
            Ok(_) => {
                warn!("decrypted to empty value, keeping original ciphertext");
                self.stats.failures += 1;
            }
            Err(e) => {
                warn!(error = %e, "decryption failed, keeping original ciphertext");
                self.stats.failures += 1;
            }
        }
    }

    /// Did any value fail to decrypt or re-encrypt?
    pub fn has_failures(&self) -> bool {
        self.stats.failures > 0
    }

    pub fn failures(&self) -> usize {
        self.stats.failures
    }

    pub fn stats(&self) -> WalkStats {
        self.stats
    }
}
