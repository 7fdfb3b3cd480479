//! Symmetric primitives consumed by the rekey engine.
//!
//! This crate only ever sees raw 32-byte keys. Versions, envelopes and key
//! lifecycle live in the `rekey` crate.

pub mod aes_gcm;
pub mod error;
pub mod hmac;
pub mod random;
pub mod types;

pub use aes_gcm::{open, seal, Sealer};
pub use error::CryptoError;
pub use hmac::keyed_hash;
pub use random::{generate_key_string, generate_tombstone, random_bytes};
pub use types::{AES_GCM_IV_LENGTH, AES_GCM_TAG_LENGTH, KEY_LENGTH, TOMBSTONE_PREFIX};
