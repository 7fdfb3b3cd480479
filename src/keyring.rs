//! Versioned key ring.
//!
//! A key's version is its permanent position in the ring. Slots are only ever
//! appended; invalidation swaps a slot's material for a tombstone in place and
//! moves the material into the [`InvalidatedKeyArchive`], where it is only
//! reachable for keyed hashing.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use rekey_crypto::{generate_tombstone, Sealer, KEY_LENGTH};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::envelope::{Envelope, CIPHER_AES_256_GCM};
use crate::error::{RekeyError, Result};

// ============================================================================
// Key material
// ============================================================================

/// Secret key string. Zeroized on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial(String);

impl KeyMaterial {
    /// Wrap a key string, requiring exactly [`KEY_LENGTH`] bytes.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.len() != KEY_LENGTH {
            return Err(RekeyError::InvalidKeyMaterial(format!(
                "expected {KEY_LENGTH} bytes, got {}",
                key.len()
            )));
        }
        Ok(Self(key))
    }

    /// Wrap archived material without length validation. Legacy keys of any
    /// length must still reproduce their historical hashes.
    pub(crate) fn archived(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh random key.
    pub fn generate() -> Result<Self> {
        Ok(Self(rekey_crypto::generate_key_string()?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// The key string as stored in deployment configuration.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Non-secret placeholder occupying an invalidated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone(String);

impl Tombstone {
    fn generate() -> Result<Self> {
        let marker = generate_tombstone()?;
        if marker.len() != KEY_LENGTH {
            return Err(RekeyError::InvalidKeyMaterial(
                "tombstone does not match the cipher key length".into(),
            ));
        }
        Ok(Self(marker))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One position in the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySlot {
    Active(KeyMaterial),
    Invalidated(Tombstone),
}

impl KeySlot {
    pub fn is_active(&self) -> bool {
        matches!(self, KeySlot::Active(_))
    }

    /// The string persisted for this slot under `crypt/key`.
    pub fn stored_value(&self) -> &str {
        match self {
            KeySlot::Active(key) => key.expose(),
            KeySlot::Invalidated(tombstone) => tombstone.as_str(),
        }
    }
}

/// What a caller intends to do with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAccess {
    /// Encrypt or decrypt.
    Crypt,
    /// Reproduce a keyed hash only.
    Hash,
}

// ============================================================================
// Invalidated key archive
// ============================================================================

/// Original material of invalidated slots, keyed by the version it served.
#[derive(Debug, Clone, Default)]
pub struct InvalidatedKeyArchive {
    keys: BTreeMap<u32, KeyMaterial>,
}

impl InvalidatedKeyArchive {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn contains(&self, version: u32) -> bool {
        self.keys.contains_key(&version)
    }

    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.keys.keys().copied()
    }

    /// Archived material for `version`. Only [`KeyAccess::Hash`] is granted.
    pub fn material(&self, version: u32, access: KeyAccess) -> Result<&KeyMaterial> {
        if access != KeyAccess::Hash {
            return Err(RekeyError::UnsupportedOperation(
                "invalidated keys can only be used for keyed hashing",
            ));
        }
        self.keys
            .get(&version)
            .ok_or(RekeyError::UnknownKeyVersion(version))
    }

    fn insert(&mut self, version: u32, key: KeyMaterial) {
        self.keys.insert(version, key);
    }

    /// `crypt/invalidated_key` lines, ascending by version.
    pub fn stored_keys(&self) -> Vec<&str> {
        self.keys.values().map(KeyMaterial::expose).collect()
    }
}

// ============================================================================
// Key ring
// ============================================================================

/// Ordered, append-only set of key slots. The highest version is always active.
pub struct KeyRing {
    slots: BTreeMap<u32, KeySlot>,
    archive: InvalidatedKeyArchive,
    sealers: HashMap<u32, Sealer>,
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRing")
            .field("slots", &self.slots)
            .field("archived", &self.archive.len())
            .finish()
    }
}

impl KeyRing {
    /// Build a ring from active keys, version 0 first.
    pub fn new(keys: Vec<KeyMaterial>) -> Result<Self> {
        Self::from_slots(
            keys.into_iter().map(KeySlot::Active).collect(),
            InvalidatedKeyArchive::default(),
        )
    }

    /// Rebuild a ring from its persisted form.
    ///
    /// * `stored` - one string per version, as found under `crypt/key`
    /// * `archived` - `(version, material)` pairs from `crypt/invalidated_versions`
    ///   and `crypt/invalidated_key`; their versions are the tombstoned slots
    pub fn from_stored(stored: &[String], archived: Vec<(u32, String)>) -> Result<Self> {
        let tombstoned: BTreeSet<u32> = archived.iter().map(|(v, _)| *v).collect();
        let mut archive = InvalidatedKeyArchive::default();
        for (version, key) in archived {
            archive.insert(version, KeyMaterial::archived(key));
        }

        let mut slots = Vec::with_capacity(stored.len());
        for (version, value) in stored.iter().enumerate() {
            let version = version as u32;
            if tombstoned.contains(&version) {
                slots.push(KeySlot::Invalidated(Tombstone(value.clone())));
            } else {
                let key = KeyMaterial::new(value.clone()).map_err(|e| match e {
                    RekeyError::InvalidKeyMaterial(reason) => {
                        RekeyError::InvalidKeyMaterial(format!("version {version}: {reason}"))
                    }
                    other => other,
                })?;
                slots.push(KeySlot::Active(key));
            }
        }
        if let Some(orphan) = tombstoned.iter().find(|v| (**v as usize) >= stored.len()) {
            return Err(RekeyError::Config(format!(
                "invalidated key version {orphan} has no slot"
            )));
        }
        Self::from_slots(slots, archive)
    }

    fn from_slots(slots: Vec<KeySlot>, archive: InvalidatedKeyArchive) -> Result<Self> {
        match slots.last() {
            None => return Err(RekeyError::Config("no encryption keys configured".into())),
            Some(KeySlot::Invalidated(_)) => {
                return Err(RekeyError::Config(
                    "the latest encryption key is invalidated".into(),
                ))
            }
            Some(KeySlot::Active(_)) => {}
        }
        let mut ring = Self {
            slots: slots
                .into_iter()
                .enumerate()
                .map(|(v, slot)| (v as u32, slot))
                .collect(),
            archive,
            sealers: HashMap::new(),
        };
        ring.rebuild_sealers()?;
        Ok(ring)
    }

    fn rebuild_sealers(&mut self) -> Result<()> {
        self.sealers.clear();
        for (version, slot) in &self.slots {
            if let KeySlot::Active(key) = slot {
                self.sealers.insert(*version, Sealer::new(key.as_bytes())?);
            }
        }
        Ok(())
    }

    /// Version of the key new ciphertext is produced with.
    pub fn latest_version(&self) -> u32 {
        self.slots.keys().next_back().copied().unwrap_or_default()
    }

    /// Material of the latest key.
    pub fn latest_material(&self) -> Result<&KeyMaterial> {
        self.key_for(self.latest_version(), KeyAccess::Crypt)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, version: u32) -> Option<&KeySlot> {
        self.slots.get(&version)
    }

    pub fn slots(&self) -> impl Iterator<Item = (u32, &KeySlot)> {
        self.slots.iter().map(|(v, s)| (*v, s))
    }

    pub fn archive(&self) -> &InvalidatedKeyArchive {
        &self.archive
    }

    /// Key material for `version`, honoring tombstones.
    ///
    /// Tombstoned versions are only reachable with [`KeyAccess::Hash`], via
    /// the archive.
    pub fn key_for(&self, version: u32, access: KeyAccess) -> Result<&KeyMaterial> {
        match self.slots.get(&version) {
            None => Err(RekeyError::UnknownKeyVersion(version)),
            Some(KeySlot::Active(key)) => Ok(key),
            Some(KeySlot::Invalidated(_)) => match access {
                KeyAccess::Crypt => Err(RekeyError::InvalidatedKeyUsed(version)),
                KeyAccess::Hash => self.archive.material(version, access),
            },
        }
    }

    fn sealer(&self, version: u32) -> Result<&Sealer> {
        self.key_for(version, KeyAccess::Crypt)?;
        self.sealers
            .get(&version)
            .ok_or(RekeyError::UnknownKeyVersion(version))
    }

    /// Decrypt a raw payload produced under `version`.
    pub fn decrypt_with(&self, version: u32, payload: &[u8]) -> Result<Vec<u8>> {
        self.sealer(version)?
            .open(payload)
            .map_err(|e| RekeyError::DecryptionFailure {
                key_version: version,
                reason: e.to_string(),
            })
    }

    /// Encrypt under the latest key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Envelope> {
        let version = self.latest_version();
        let payload = self.sealer(version)?.seal(plaintext)?;
        Ok(Envelope::new(version, CIPHER_AES_256_GCM, payload))
    }

    /// Append a new active key and return its version.
    pub fn append_key(&mut self, key: KeyMaterial) -> Result<u32> {
        let version = self.slots.len() as u32;
        self.sealers.insert(version, Sealer::new(key.as_bytes())?);
        self.slots.insert(version, KeySlot::Active(key));
        info!(version, "appended encryption key");
        Ok(version)
    }

    /// Tombstone every slot except the latest, archiving the original material.
    ///
    /// Returns the versions invalidated by this call; already-tombstoned slots
    /// are skipped, so a second call returns an empty list.
    pub fn invalidate_all_but_latest(&mut self) -> Result<Vec<u32>> {
        if self.slots.len() <= 1 {
            return Err(RekeyError::InsufficientKeys);
        }
        let latest = self.latest_version();
        let mut invalidated = Vec::new();
        for (version, slot) in self.slots.iter_mut() {
            if *version == latest {
                break;
            }
            if let KeySlot::Active(key) = slot {
                let tombstone = Tombstone::generate()?;
                self.archive.insert(*version, key.clone());
                *slot = KeySlot::Invalidated(tombstone);
                self.sealers.remove(version);
                invalidated.push(*version);
                debug!(version, "tombstoned key slot");
            }
        }
        if !invalidated.is_empty() {
            info!(count = invalidated.len(), latest, "invalidated superseded keys");
        }
        Ok(invalidated)
    }

    /// `crypt/key` lines, version 0 first.
    pub fn stored_keys(&self) -> Vec<&str> {
        self.slots.values().map(KeySlot::stored_value).collect()
    }
}
