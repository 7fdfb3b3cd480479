//! Scoped field re-encryption inside a serialized JSON blob.
//!
//! Only the addressed field changes. Sibling fields keep their values and
//! their order; the blob is re-serialized compactly.

use serde_json::Value;

use crate::encryptor::SecretCipher;
use crate::envelope::{is_current, looks_like_ciphertext, peek_key_version};
use crate::error::{RekeyError, Result};

/// Why a blob was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The path does not exist or holds an empty string / null.
    Empty,
    /// The field holds something that is not ciphertext.
    NotCiphertext,
    /// The field is already under the latest key.
    AlreadyCurrent,
}

/// Result of re-encrypting one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOutcome {
    Updated {
        blob: String,
        old_ciphertext: String,
        new_ciphertext: String,
    },
    Skipped(SkipReason),
}

/// Resolve a dotted path (`google.secret`, `devices.0.key`) to a mutable node.
pub fn field_mut<'v>(root: &'v mut Value, path: &str) -> Option<&'v mut Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}

/// Re-encrypt the ciphertext at `path` inside `blob`.
///
/// Decryption failures are returned as errors; whether they are fatal is the
/// caller's decision.
pub fn reencrypt_field<C: SecretCipher + ?Sized>(
    blob: &str,
    path: &str,
    cipher: &C,
) -> Result<FieldOutcome> {
    if path.is_empty() {
        return Err(RekeyError::InvalidArgument("field path is empty".into()));
    }
    let mut doc: Value = serde_json::from_str(blob)?;
    let Some(node) = field_mut(&mut doc, path) else {
        return Ok(FieldOutcome::Skipped(SkipReason::Empty));
    };
    let current = match node {
        Value::Null => return Ok(FieldOutcome::Skipped(SkipReason::Empty)),
        Value::String(s) if s.is_empty() => return Ok(FieldOutcome::Skipped(SkipReason::Empty)),
        Value::String(s) => s.clone(),
        _ => return Ok(FieldOutcome::Skipped(SkipReason::NotCiphertext)),
    };
    if !looks_like_ciphertext(&current) {
        return Ok(FieldOutcome::Skipped(SkipReason::NotCiphertext));
    }
    if is_current(&current, cipher.latest_version()) {
        return Ok(FieldOutcome::Skipped(SkipReason::AlreadyCurrent));
    }

    let plaintext = cipher.decrypt(&current)?;
    if plaintext.is_empty() {
        return Err(RekeyError::DecryptionFailure {
            key_version: peek_key_version(&current).unwrap_or_default(),
            reason: "decrypted to an empty value".into(),
        });
    }
    let replacement = cipher.encrypt(&plaintext)?;
    *node = Value::String(replacement.clone());

    Ok(FieldOutcome::Updated {
        blob: serde_json::to_string(&doc)?,
        old_ciphertext: current,
        new_ciphertext: replacement,
    })
}
