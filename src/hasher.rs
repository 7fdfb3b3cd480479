//! Keyed-hash views over the key ring.
//!
//! [`InvalidatedKeyHasher`] is built from the invalidated key archive and can
//! only hash. It exists so that fingerprints computed under a retired key
//! (cache-busting asset paths, for instance) stay stable after the key is
//! tombstoned.

use crate::error::Result;
use crate::keyring::{InvalidatedKeyArchive, KeyAccess, KeyMaterial, KeyRing};

/// The one capability a hash-only key view has.
pub trait KeyedHasher {
    /// Version of the key the digest is computed under.
    fn key_version(&self) -> u32;

    /// HMAC-SHA256 of `data`, hex encoded.
    fn hash(&self, data: &str) -> Result<String>;
}

/// Hashes with an active slot of the ring.
pub struct ActiveKeyHasher<'r> {
    version: u32,
    key: &'r KeyMaterial,
}

impl<'r> ActiveKeyHasher<'r> {
    pub fn new(ring: &'r KeyRing, version: u32) -> Result<Self> {
        let key = ring.key_for(version, KeyAccess::Crypt)?;
        Ok(Self { version, key })
    }
}

impl KeyedHasher for ActiveKeyHasher<'_> {
    fn key_version(&self) -> u32 {
        self.version
    }

    fn hash(&self, data: &str) -> Result<String> {
        Ok(rekey_crypto::keyed_hash(self.key.as_bytes(), data.as_bytes())?)
    }
}

/// Hash-only view over one archived key.
pub struct InvalidatedKeyHasher {
    version: u32,
    key: KeyMaterial,
}

impl InvalidatedKeyHasher {
    pub fn new(archive: &InvalidatedKeyArchive, version: u32) -> Result<Self> {
        let key = archive.material(version, KeyAccess::Hash)?.clone();
        Ok(Self { version, key })
    }
}

impl KeyedHasher for InvalidatedKeyHasher {
    fn key_version(&self) -> u32 {
        self.version
    }

    fn hash(&self, data: &str) -> Result<String> {
        Ok(rekey_crypto::keyed_hash(self.key.as_bytes(), data.as_bytes())?)
    }
}

/// Pick the hasher for fingerprints.
///
/// With no pinned version the latest key is used. A pinned version resolves
/// to its active slot, or to the archive once that slot has been tombstoned.
pub fn fingerprint_hasher<'r>(
    ring: &'r KeyRing,
    pinned_version: Option<u32>,
) -> Result<Box<dyn KeyedHasher + 'r>> {
    let version = pinned_version.unwrap_or_else(|| ring.latest_version());
    if ring.archive().contains(version) {
        return Ok(Box::new(InvalidatedKeyHasher::new(ring.archive(), version)?));
    }
    Ok(Box::new(ActiveKeyHasher::new(ring, version)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RekeyError;
    use rekey_crypto::KEY_LENGTH;

    fn ring3() -> KeyRing {
        KeyRing::new(
            ['a', 'b', 'c']
                .iter()
                .map(|c| KeyMaterial::new(c.to_string().repeat(KEY_LENGTH)).unwrap())
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn fingerprint_survives_invalidation() {
        let mut ring = ring3();
        let before = fingerprint_hasher(&ring, Some(1))
            .unwrap()
            .hash("catalog/product/image.jpg")
            .unwrap();

        ring.invalidate_all_but_latest().unwrap();

        let hasher = fingerprint_hasher(&ring, Some(1)).unwrap();
        assert_eq!(hasher.key_version(), 1);
        assert_eq!(hasher.hash("catalog/product/image.jpg").unwrap(), before);
    }

    #[test]
    fn unpinned_uses_latest() {
        let ring = ring3();
        let hasher = fingerprint_hasher(&ring, None).unwrap();
        assert_eq!(hasher.key_version(), 2);
        let expected =
            rekey_crypto::keyed_hash("c".repeat(KEY_LENGTH).as_bytes(), b"data").unwrap();
        assert_eq!(hasher.hash("data").unwrap(), expected);
    }

    #[test]
    fn archived_view_needs_archived_version() {
        let ring = ring3();
        assert!(matches!(
            InvalidatedKeyHasher::new(ring.archive(), 0),
            Err(RekeyError::UnknownKeyVersion(0))
        ));
    }

    #[test]
    fn archive_refuses_crypt_access() {
        let mut ring = ring3();
        ring.invalidate_all_but_latest().unwrap();
        assert!(matches!(
            ring.archive().material(0, KeyAccess::Crypt),
            Err(RekeyError::UnsupportedOperation(_))
        ));
        assert!(InvalidatedKeyHasher::new(ring.archive(), 0).unwrap().hash("x").is_ok());
    }

    #[test]
    fn unknown_pinned_version() {
        let ring = ring3();
        assert!(matches!(
            fingerprint_hasher(&ring, Some(7)).err(),
            Some(RekeyError::UnknownKeyVersion(7))
        ));
    }
}
