//! HMAC-SHA256 keyed hashing.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 of `data` under `key`, hex encoded.
///
/// Any key length is accepted so that archived keys of legacy lengths still
/// reproduce the fingerprints they produced.
pub fn keyed_hash(key: &[u8], data: &[u8]) -> Result<String, CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| CryptoError::HmacKey(e.to_string()))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
