/// AES-256 key length in bytes. Every key slot, tombstone included, has this length.
pub const KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes.
pub const AES_GCM_IV_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// Readable prefix of generated tombstones. Never used to detect tombstones,
/// only to make them recognizable to a human reading the deployment config.
pub const TOMBSTONE_PREFIX: &str = "rekey-invalidated-";
