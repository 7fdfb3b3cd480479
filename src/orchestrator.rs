//! Key rotation and key invalidation.
//!
//! A rotation appends a key and then moves every surface onto it, one step
//! at a time:
//!
//! ```text
//! Idle → KeyAppended → ConfigReencrypted → CreditCardSurfaceReencrypted
//!      → EnvSegmentReencrypted → Done
//! ```
//!
//! Any failure moves to `Failed` and is reported as
//! [`RekeyError::RotationFailed`] with the last state reached. Steps are not
//! transactional with each other. Re-running is the recovery path: values
//! already under the latest key are skipped.
//!
//! Invalidation is a separate operation and never runs as part of a
//! rotation.

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::cache::CacheInvalidator;
use crate::config::{paths, ConfigWriter};
use crate::config_tree::{ConfigRows, SystemConfigTable};
use crate::encryptor::Encryptor;
use crate::error::{RekeyError, Result};
use crate::keyring::KeyMaterial;
use crate::scanner::{ScanOptions, ScanReport, TableScanner, TableTarget};
use crate::storage::SecretStore;
use crate::walker::{StructuralReencryptor, WalkStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RotationState {
    Idle,
    KeyAppended,
    ConfigReencrypted,
    CreditCardSurfaceReencrypted,
    EnvSegmentReencrypted,
    Done,
    Failed,
}

#[derive(Debug, Default)]
pub struct RotationOptions {
    /// Key to append; a random one is generated when absent.
    pub new_key: Option<KeyMaterial>,
    pub skip_saved_credit_cards: bool,
    /// Reuse the latest key instead of appending one, to finish a rotation
    /// that failed part way.
    pub resume: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub states: Vec<RotationState>,
    pub previous_version: u32,
    pub latest_version: u32,
    pub system_config: WalkStats,
    pub system_config_rows_updated: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_credit_cards: Option<ScanReport>,
    pub env_segment: WalkStats,
}

impl RotationReport {
    pub fn failures(&self) -> usize {
        self.system_config.failures
            + self.env_segment.failures
            + self.saved_credit_cards.as_ref().map_or(0, |r| r.failures)
    }
}

// ============================================================================
// KeyRotation
// ============================================================================

pub struct KeyRotation<'a, S, W: ?Sized, K: ?Sized> {
    store: &'a S,
    writer: &'a W,
    cache: &'a K,
    state: RotationState,
}

impl<'a, S, W, K> KeyRotation<'a, S, W, K>
where
    S: SecretStore + ConfigRows,
    W: ConfigWriter + ?Sized,
    K: CacheInvalidator + ?Sized,
{
    pub fn new(store: &'a S, writer: &'a W, cache: &'a K) -> Self {
        Self {
            store,
            writer,
            cache,
            state: RotationState::Idle,
        }
    }

    pub fn state(&self) -> RotationState {
        self.state
    }

    pub fn run(&mut self, options: RotationOptions) -> Result<RotationReport> {
        if self.state != RotationState::Idle {
            return Err(RekeyError::UnsupportedOperation("a rotation runs only once"));
        }
        let mut report = RotationReport::default();
        match self.run_steps(options, &mut report) {
            Ok(()) => Ok(report),
            Err(e) => {
                let reached = self.state;
                self.state = RotationState::Failed;
                error!(state = ?reached, error = %e, "rotation failed");
                Err(RekeyError::RotationFailed {
                    state: reached,
                    source: Box::new(e),
                })
            }
        }
    }

    fn advance(&mut self, to: RotationState, report: &mut RotationReport) {
        info!(from = ?self.state, to = ?to, "rotation step complete");
        self.state = to;
        report.states.push(to);
    }

    fn run_steps(&mut self, options: RotationOptions, report: &mut RotationReport) -> Result<()> {
        // Idle → KeyAppended
        let mut config = self.writer.load()?;
        let mut ring = config.key_ring()?;
        report.previous_version = ring.latest_version();
        if options.resume {
            info!(version = ring.latest_version(), "resuming with the latest key");
        } else {
            let key = match options.new_key {
                Some(key) => key,
                None => KeyMaterial::generate()?,
            };
            ring.append_key(key)?;
            if config.hash_key_version()?.is_none() {
                config.set(
                    paths::CRYPT_HASH_KEY_VERSION,
                    Value::from(report.previous_version),
                )?;
            }
            config.store_key_ring(&ring)?;
            self.writer.save(&config)?;
        }
        report.latest_version = ring.latest_version();
        self.advance(RotationState::KeyAppended, report);

        let audit = config.decrypt_audit();

        // → ConfigReencrypted
        let cipher = Encryptor::new(&ring)
            .with_audit(audit)
            .with_context("system_config");
        let table = SystemConfigTable::new(self.store);
        let mut tree = table.load()?;
        report.system_config = tree.reencrypt(&cipher);
        report.system_config_rows_updated = table.save(&tree)?;
        self.advance(RotationState::ConfigReencrypted, report);

        // → CreditCardSurfaceReencrypted
        if options.skip_saved_credit_cards {
            info!("skipping saved credit cards");
        } else {
            let cipher = Encryptor::new(&ring)
                .with_audit(audit)
                .with_context("saved_credit_cards");
            let scan = TableScanner::new(self.store, &cipher)
                .run(&TableTarget::saved_credit_cards(), &ScanOptions::apply())?;
            report.saved_credit_cards = Some(scan);
        }
        self.advance(RotationState::CreditCardSurfaceReencrypted, report);

        // → EnvSegmentReencrypted, from freshly loaded configuration
        let mut fresh = self.writer.load()?;
        let cipher = Encryptor::new(&ring)
            .with_audit(audit)
            .with_context("env_system");
        let mut walker = StructuralReencryptor::new(&cipher);
        let original = fresh.segment(paths::SYSTEM);
        let system = walker.walk(original.clone());
        report.env_segment = walker.stats();
        if system != original {
            fresh.set(paths::SYSTEM, system)?;
            fresh.regenerate_system_hash()?;
            self.writer.save(&fresh)?;
        }
        self.advance(RotationState::EnvSegmentReencrypted, report);

        // → Done
        self.cache.invalidate()?;
        self.advance(RotationState::Done, report);
        Ok(())
    }
}

// ============================================================================
// Invalidation
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub latest_version: u32,
    /// Versions tombstoned by this run; empty when nothing was left to do.
    pub invalidated: Vec<u32>,
}

/// Tombstone every key but the latest and persist the ring.
///
/// Irreversible: only run once every surface is known to be re-encrypted.
pub fn invalidate_old_keys<W, K>(writer: &W, cache: &K) -> Result<InvalidationReport>
where
    W: ConfigWriter + ?Sized,
    K: CacheInvalidator + ?Sized,
{
    let mut config = writer.load()?;
    let mut ring = config.key_ring()?;
    let invalidated = ring.invalidate_all_but_latest()?;
    let report = InvalidationReport {
        latest_version: ring.latest_version(),
        invalidated,
    };
    if report.invalidated.is_empty() {
        info!("no further keys need invalidating");
        return Ok(report);
    }

    config.store_key_ring(&ring)?;
    writer.save(&config)?;
    cache.invalidate()?;
    info!(invalidated = ?report.invalidated, "old keys invalidated");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NoopCache;
    use crate::config::{DeploymentConfig, MemoryWriter};
    use crate::encryptor::test_support::encrypt_at;
    use crate::encryptor::SecretCipher;
    use crate::scanner::{CONFIG_TABLE, CREDIT_CARD_TABLE};
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::cell::Cell;

    fn key(c: char) -> String {
        c.to_string().repeat(rekey_crypto::KEY_LENGTH)
    }

    /// One old key (`aaaa…`), one stored secret per surface.
    fn fixture() -> (MemoryStore, MemoryWriter) {
        let store = MemoryStore::new();
        store.insert(CONFIG_TABLE, 1, "scope", Some("default"));
        store.insert(CONFIG_TABLE, 1, "scope_id", Some("0"));
        store.insert(CONFIG_TABLE, 1, "path", Some("payment/gateway/api_key"));
        store.insert(CONFIG_TABLE, 1, "value", Some(&encrypt_at(0, "api-key")));
        store.insert(CREDIT_CARD_TABLE, 1, "cc_number_enc", Some(&encrypt_at(0, "4111")));
        store.insert(CREDIT_CARD_TABLE, 2, "cc_number_enc", None);

        let config = DeploymentConfig::from_value(json!({
            "crypt": { "key": key('a') },
            "system": { "default": { "carriers": { "ups": { "password": encrypt_at(0, "ups") } } } }
        }))
        .unwrap();
        (store, MemoryWriter::new(config))
    }

    fn new_key() -> Option<KeyMaterial> {
        Some(KeyMaterial::new(key('b')).unwrap())
    }

    #[test]
    fn full_rotation_moves_every_surface() {
        let (store, writer) = fixture();
        let mut rotation = KeyRotation::new(&store, &writer, &NoopCache);
        let report = rotation
            .run(RotationOptions {
                new_key: new_key(),
                ..RotationOptions::default()
            })
            .unwrap();

        assert_eq!(rotation.state(), RotationState::Done);
        assert_eq!(
            report.states,
            vec![
                RotationState::KeyAppended,
                RotationState::ConfigReencrypted,
                RotationState::CreditCardSurfaceReencrypted,
                RotationState::EnvSegmentReencrypted,
                RotationState::Done,
            ]
        );
        assert_eq!((report.previous_version, report.latest_version), (0, 1));
        assert_eq!(report.failures(), 0);

        let config = writer.snapshot();
        let ring = config.key_ring().unwrap();
        let enc = Encryptor::new(&ring);
        assert_eq!(ring.latest_version(), 1);
        assert_eq!(config.hash_key_version().unwrap(), Some(0));

        let value = store.value(CONFIG_TABLE, 1, "value").unwrap();
        assert!(value.starts_with("1:1:"));
        assert_eq!(enc.decrypt(&value).unwrap(), "api-key");
        let card = store.value(CREDIT_CARD_TABLE, 1, "cc_number_enc").unwrap();
        assert_eq!(enc.decrypt(&card).unwrap(), "4111");
        let ups = config.get_str("system/default/carriers/ups/password").unwrap();
        assert_eq!(enc.decrypt(ups).unwrap(), "ups");
        assert_eq!(
            config.get_str(paths::HASH_SYSTEM),
            Some(config.system_hash().unwrap().as_str())
        );
    }

    #[test]
    fn skip_saved_credit_cards() {
        let (store, writer) = fixture();
        let report = KeyRotation::new(&store, &writer, &NoopCache)
            .run(RotationOptions {
                new_key: new_key(),
                skip_saved_credit_cards: true,
                ..RotationOptions::default()
            })
            .unwrap();
        assert!(report.saved_credit_cards.is_none());
        assert!(store
            .value(CREDIT_CARD_TABLE, 1, "cc_number_enc")
            .unwrap()
            .starts_with("0:1:"));
    }

    #[test]
    fn failure_reports_last_state_and_resume_finishes() {
        let (store, writer) = fixture();
        store.insert(CREDIT_CARD_TABLE, 3, "cc_number_enc", Some("5:1:YWJjZA=="));

        let mut rotation = KeyRotation::new(&store, &writer, &NoopCache);
        let err = rotation
            .run(RotationOptions {
                new_key: new_key(),
                ..RotationOptions::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            RekeyError::RotationFailed {
                state: RotationState::ConfigReencrypted,
                ..
            }
        ));
        assert_eq!(err.exit_code(), RekeyError::UnknownKeyVersion(5).exit_code());
        assert_eq!(rotation.state(), RotationState::Failed);
        // Earlier steps stay applied; the card table rolled back.
        assert!(store.value(CONFIG_TABLE, 1, "value").unwrap().starts_with("1:1:"));
        assert!(store
            .value(CREDIT_CARD_TABLE, 1, "cc_number_enc")
            .unwrap()
            .starts_with("0:1:"));

        store.insert(CREDIT_CARD_TABLE, 3, "cc_number_enc", None);
        let report = KeyRotation::new(&store, &writer, &NoopCache)
            .run(RotationOptions {
                resume: true,
                ..RotationOptions::default()
            })
            .unwrap();
        assert_eq!(report.latest_version, 1);
        assert_eq!(report.system_config.reencrypted, 0);
        assert_eq!(report.system_config.skipped_current, 1);
        assert_eq!(report.saved_credit_cards.unwrap().updated, 1);
    }

    #[test]
    fn rerun_skips_current_values() {
        let (store, writer) = fixture();
        KeyRotation::new(&store, &writer, &NoopCache)
            .run(RotationOptions {
                new_key: new_key(),
                ..RotationOptions::default()
            })
            .unwrap();
        let writes = store.write_count();

        let report = KeyRotation::new(&store, &writer, &NoopCache)
            .run(RotationOptions {
                resume: true,
                ..RotationOptions::default()
            })
            .unwrap();
        assert_eq!(store.write_count(), writes);
        assert_eq!(report.env_segment.reencrypted, 0);
        assert_eq!(report.saved_credit_cards.unwrap().updated, 0);
    }

    #[test]
    fn rotation_runs_once() {
        let (store, writer) = fixture();
        let mut rotation = KeyRotation::new(&store, &writer, &NoopCache);
        rotation.run(RotationOptions::default()).unwrap();
        assert!(matches!(
            rotation.run(RotationOptions::default()),
            Err(RekeyError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn cache_is_invalidated_last() {
        let (store, writer) = fixture();
        let calls = Cell::new(0);
        let cache = || -> Result<()> {
            calls.set(calls.get() + 1);
            Ok(())
        };
        KeyRotation::new(&store, &writer, &cache)
            .run(RotationOptions::default())
            .unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn invalidation_is_explicit_and_idempotent() {
        let (store, writer) = fixture();
        assert!(matches!(
            invalidate_old_keys(&writer, &NoopCache),
            Err(RekeyError::InsufficientKeys)
        ));

        KeyRotation::new(&store, &writer, &NoopCache)
            .run(RotationOptions {
                new_key: new_key(),
                ..RotationOptions::default()
            })
            .unwrap();
        let first = invalidate_old_keys(&writer, &NoopCache).unwrap();
        assert_eq!(first.invalidated, vec![0]);
        assert_eq!(first.latest_version, 1);

        let config = writer.snapshot();
        assert_eq!(config.get_str(paths::CRYPT_INVALIDATED_KEY), Some(key('a').as_str()));
        assert_eq!(config.get_str(paths::CRYPT_INVALIDATED_VERSIONS), Some("0"));
        assert_eq!(config.latest_key(), Some(key('b').as_str()));

        let saves = writer.save_count();
        let second = invalidate_old_keys(&writer, &NoopCache).unwrap();
        assert!(second.invalidated.is_empty());
        assert_eq!(writer.save_count(), saves);
    }
}
