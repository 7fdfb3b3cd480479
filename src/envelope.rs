//! Versioned ciphertext envelope: `{key_version}:{cipher_version}:{base64 payload}`.
//!
//! Anything that does not have this shape is plaintext. Parsing never fails
//! loudly; callers that need a reason use [`Envelope::parse`].

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{RekeyError, Result};

/// Cipher version written by this engine (AES-256-GCM, random 96-bit IV).
pub const CIPHER_AES_256_GCM: u32 = 1;

// ASCII digits and ASCII whitespace only; `\d` and `\S` are Unicode-aware.
static SHAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]+:[0-9]+:[^\t\n\x0B\x0C\r ]+").expect("Invalid envelope regex")
});

/// True iff `s` has the `digits:digits:non-whitespace` shape.
///
/// Cheap pre-filter: a `true` here does not promise the value decrypts.
pub fn looks_like_ciphertext(s: &str) -> bool {
    SHAPE.is_match(s)
}

/// True iff `s` was produced under `latest_version`.
pub fn is_current(s: &str, latest_version: u32) -> bool {
    s.strip_prefix(latest_version.to_string().as_str())
        .is_some_and(|rest| rest.starts_with(':'))
}

/// True iff `s` is ciphertext that still needs re-encryption.
pub fn is_stale(s: &str, latest_version: u32) -> bool {
    looks_like_ciphertext(s) && !is_current(s, latest_version)
}

/// Read only the key version of a ciphertext-shaped value.
pub fn peek_key_version(s: &str) -> Option<u32> {
    if !looks_like_ciphertext(s) {
        return None;
    }
    s.split(':').next()?.parse().ok()
}

/// Parsed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub key_version: u32,
    pub cipher_version: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(key_version: u32, cipher_version: u32, payload: Vec<u8>) -> Self {
        Self {
            key_version,
            cipher_version,
            payload,
        }
    }

    /// Parse an envelope string. Shape mismatches, overflowing version
    /// numbers and undecodable payloads are all `MalformedEnvelope`.
    pub fn parse(s: &str) -> Result<Self> {
        if !looks_like_ciphertext(s) {
            return Err(RekeyError::MalformedEnvelope(
                "expected {key}:{cipher}:{payload}".into(),
            ));
        }
        let mut parts = s.splitn(3, ':');
        let key_version = parse_version(parts.next(), "key")?;
        let cipher_version = parse_version(parts.next(), "cipher")?;
        let encoded = parts.next().unwrap_or_default();
        if encoded.chars().any(char::is_whitespace) {
            return Err(RekeyError::MalformedEnvelope(
                "payload contains whitespace".into(),
            ));
        }
        let payload = STANDARD
            .decode(encoded)
            .map_err(|e| RekeyError::MalformedEnvelope(format!("payload: {e}")))?;
        Ok(Self::new(key_version, cipher_version, payload))
    }

    /// Tolerant parse: `None` means "treat as plaintext".
    pub fn try_parse(s: &str) -> Option<Self> {
        Self::parse(s).ok()
    }
}

fn parse_version(part: Option<&str>, which: &str) -> Result<u32> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| RekeyError::MalformedEnvelope(format!("{which} version out of range")))
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.key_version,
            self.cipher_version,
            STANDARD.encode(&self.payload)
        )
    }
}
