//! Encryption key rotation for versioned ciphertext at rest.
//!
//! Ciphertext is stored as `"<key_version>:<cipher_version>:<payload>"`.
//! A rotation appends a key to the [`KeyRing`], re-encrypts every surface that
//! still holds values under older keys, and leaves the old keys usable for
//! decryption until they are explicitly invalidated.
//!
//! The pieces:
//!
//! - [`envelope`]: parse and render the envelope format
//! - [`keyring`]: versioned keys, tombstones and the invalidated key archive
//! - [`hasher`]: the hash-only view over archived keys
//! - [`walker`]: re-encrypt ciphertext nested anywhere in a JSON value
//! - [`field`]: re-encrypt one path inside a serialized JSON blob
//! - [`scanner`]: batch re-encryption of a table column
//! - [`env`]: report environment-supplied values still under old keys
//! - [`orchestrator`]: the rotation state machine and key invalidation

pub mod cache;
pub mod cli;
pub mod config;
pub mod config_tree;
pub mod encryptor;
pub mod env;
pub mod envelope;
pub mod error;
pub mod field;
pub mod hasher;
pub mod keyring;
pub mod orchestrator;
pub mod scanner;
pub mod storage;
pub mod walker;

pub use cache::{CacheInvalidator, NoopCache};
pub use config::{ConfigWriter, DeploymentConfig, JsonFileWriter, MemoryWriter};
pub use config_tree::{ConfigRows, ConfigTree, SystemConfigTable};
pub use encryptor::{DecryptAudit, Encryptor, SecretCipher};
pub use env::{EnvReport, EnvReporter};
pub use envelope::Envelope;
pub use error::{RekeyError, Result};
pub use field::{reencrypt_field, FieldOutcome};
pub use hasher::{fingerprint_hasher, InvalidatedKeyHasher, KeyedHasher};
pub use keyring::{KeyMaterial, KeyRing, KeySlot};
pub use orchestrator::{
    invalidate_old_keys, InvalidationReport, KeyRotation, RotationOptions, RotationReport,
    RotationState,
};
pub use scanner::{ScanMode, ScanOptions, ScanReport, TableScanner, TableTarget, WindowWrite};
pub use storage::{MemoryStore, SecretStore, SqliteStore};
pub use walker::{StructuralReencryptor, WalkStats};
