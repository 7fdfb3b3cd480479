//! Deployment configuration: a JSON document addressed by slash paths.

use std::fs;
use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::encryptor::DecryptAudit;
use crate::error::{RekeyError, Result};
use crate::keyring::KeyRing;

/// Well-known paths.
pub mod paths {
    pub const CRYPT_KEY: &str = "crypt/key";
    pub const CRYPT_INVALIDATED_KEY: &str = "crypt/invalidated_key";
    pub const CRYPT_INVALIDATED_VERSIONS: &str = "crypt/invalidated_versions";
    pub const CRYPT_HASH_KEY_VERSION: &str = "crypt/hash_key_version";
    pub const SYSTEM: &str = "system";
    pub const HASH_SYSTEM: &str = "hash/system";
    pub const DECRYPT_LOGGING: &str = "system/default/dev/debug/rekey_enable_decrypt_logging";
    pub const DECRYPT_LOGGING_ONLY_OLD: &str =
        "system/default/dev/debug/rekey_only_log_old_decrypts";
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentConfig {
    root: Value,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            root: Value::Object(Map::new()),
        }
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// `true`, non-zero numbers and `"1"`/`"true"` strings.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

impl DeploymentConfig {
    pub fn from_value(root: Value) -> Result<Self> {
        if !root.is_object() {
            return Err(RekeyError::Config(
                "deployment configuration must be a JSON object".into(),
            ));
        }
        Ok(Self { root })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            RekeyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        segments(path).try_fold(&self.root, |node, key| node.get(key))
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Owned copy of the subtree at `path`, `Null` when absent.
    pub fn segment(&self, path: &str) -> Value {
        self.get(path).cloned().unwrap_or(Value::Null)
    }

    /// Set `path`, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let keys: Vec<&str> = segments(path).collect();
        let Some((last, parents)) = keys.split_last() else {
            return Err(RekeyError::Config("empty configuration path".into()));
        };
        let mut node = &mut self.root;
        for key in parents {
            let map = node.as_object_mut().ok_or_else(|| {
                RekeyError::Config(format!("{path}: {key} is inside a non-object value"))
            })?;
            node = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        node.as_object_mut()
            .ok_or_else(|| RekeyError::Config(format!("{path}: parent is not an object")))?
            .insert(last.to_string(), value);
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let keys: Vec<&str> = segments(path).collect();
        let (last, parents) = keys.split_last()?;
        let parent = parents
            .iter()
            .try_fold(&mut self.root, |node, key| node.get_mut(*key))?;
        parent.as_object_mut()?.remove(*last)
    }

    /// Every `crypt/key` entry, version 0 first.
    pub fn keys(&self) -> Vec<String> {
        self.get_str(paths::CRYPT_KEY)
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Only the latest key, for consumers that must never see older ones.
    pub fn latest_key(&self) -> Option<&str> {
        self.get_str(paths::CRYPT_KEY)?.split_whitespace().next_back()
    }

    /// Rebuild the key ring from `crypt/*`.
    pub fn key_ring(&self) -> Result<KeyRing> {
        let keys = self.keys();
        if keys.is_empty() {
            return Err(RekeyError::Config(format!("{} is not set", paths::CRYPT_KEY)));
        }

        let archived: Vec<&str> = self
            .get_str(paths::CRYPT_INVALIDATED_KEY)
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default();
        let versions = self
            .get_str(paths::CRYPT_INVALIDATED_VERSIONS)
            .map(|s| {
                s.split_whitespace()
                    .map(|v| {
                        v.parse::<u32>().map_err(|_| {
                            RekeyError::Config(format!(
                                "{}: {v:?} is not a version",
                                paths::CRYPT_INVALIDATED_VERSIONS
                            ))
                        })
                    })
                    .collect::<Result<Vec<u32>>>()
            })
            .transpose()?
            .unwrap_or_default();
        if archived.len() != versions.len() {
            return Err(RekeyError::Config(format!(
                "{} lists {} keys but {} lists {} versions",
                paths::CRYPT_INVALIDATED_KEY,
                archived.len(),
                paths::CRYPT_INVALIDATED_VERSIONS,
                versions.len()
            )));
        }

        let pairs = versions
            .into_iter()
            .zip(archived.into_iter().map(str::to_string))
            .collect();
        KeyRing::from_stored(&keys, pairs)
    }

    /// Write the ring back under `crypt/*`.
    pub fn store_key_ring(&mut self, ring: &KeyRing) -> Result<()> {
        self.set(paths::CRYPT_KEY, Value::String(ring.stored_keys().join("\n")))?;
        let archive = ring.archive();
        if archive.is_empty() {
            self.remove(paths::CRYPT_INVALIDATED_KEY);
            self.remove(paths::CRYPT_INVALIDATED_VERSIONS);
            return Ok(());
        }
        self.set(
            paths::CRYPT_INVALIDATED_KEY,
            Value::String(archive.stored_keys().join("\n")),
        )?;
        let versions: Vec<String> = archive.versions().map(|v| v.to_string()).collect();
        self.set(paths::CRYPT_INVALIDATED_VERSIONS, Value::String(versions.join(" ")))
    }

    /// Archive version the hash-only view reproduces, if recorded.
    pub fn hash_key_version(&self) -> Result<Option<u32>> {
        match self.get(paths::CRYPT_HASH_KEY_VERSION) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| {
                    RekeyError::Config(format!("bad {}", paths::CRYPT_HASH_KEY_VERSION))
                }),
            Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| {
                RekeyError::Config(format!("bad {}: {s:?}", paths::CRYPT_HASH_KEY_VERSION))
            }),
            Some(other) => Err(RekeyError::Config(format!(
                "bad {}: {other}",
                paths::CRYPT_HASH_KEY_VERSION
            ))),
        }
    }

    /// SHA-256 hex of the serialized `system` segment.
    pub fn system_hash(&self) -> Result<String> {
        let bytes = serde_json::to_vec(&self.segment(paths::SYSTEM))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Recompute `hash/system` after the `system` segment changed.
    pub fn regenerate_system_hash(&mut self) -> Result<()> {
        let hash = self.system_hash()?;
        self.set(paths::HASH_SYSTEM, Value::String(hash))
    }

    pub fn decrypt_audit(&self) -> DecryptAudit {
        DecryptAudit {
            enabled: truthy(self.get(paths::DECRYPT_LOGGING)),
            only_old_keys: truthy(self.get(paths::DECRYPT_LOGGING_ONLY_OLD)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(c: char) -> String {
        c.to_string().repeat(rekey_crypto::KEY_LENGTH)
    }

    #[test]
    fn slash_paths() {
        let mut config = DeploymentConfig::default();
        config.set("system/default/payment/key", json!("0:1:abc")).unwrap();
        assert_eq!(config.get_str("system/default/payment/key"), Some("0:1:abc"));
        assert_eq!(config.segment("system")["default"]["payment"]["key"], json!("0:1:abc"));
        assert_eq!(config.segment("missing"), Value::Null);
        assert_eq!(config.remove("system/default/payment/key"), Some(json!("0:1:abc")));
        assert_eq!(config.get("system/default/payment/key"), None);
    }

    #[test]
    fn set_through_scalar_fails() {
        let mut config = DeploymentConfig::from_value(json!({ "crypt": "flat" })).unwrap();
        assert!(matches!(
            config.set("crypt/key", json!("x")),
            Err(RekeyError::Config(_))
        ));
    }

    #[test]
    fn latest_key_hides_older_keys() {
        let config = DeploymentConfig::from_value(json!({
            "crypt": { "key": format!("{}\n{}\n", key('a'), key('b')) }
        }))
        .unwrap();
        assert_eq!(config.latest_key(), Some(key('b').as_str()));
        assert_eq!(config.keys().len(), 2);
    }

    #[test]
    fn key_ring_round_trip_with_tombstones() {
        let mut config = DeploymentConfig::from_value(json!({
            "crypt": { "key": format!("{}\n{}\n{}", key('a'), key('b'), key('c')) }
        }))
        .unwrap();
        let mut ring = config.key_ring().unwrap();
        ring.invalidate_all_but_latest().unwrap();
        config.store_key_ring(&ring).unwrap();

        assert_eq!(config.get_str(paths::CRYPT_INVALIDATED_VERSIONS), Some("0 1"));
        let reloaded = config.key_ring().unwrap();
        assert_eq!(reloaded.latest_version(), 2);
        assert!(reloaded.archive().contains(0));
        assert!(reloaded.archive().contains(1));
        assert_eq!(reloaded.stored_keys(), ring.stored_keys());
    }

    #[test]
    fn mismatched_archive_is_rejected() {
        let config = DeploymentConfig::from_value(json!({
            "crypt": {
                "key": format!("{}\n{}", key('a'), key('b')),
                "invalidated_key": key('z'),
            }
        }))
        .unwrap();
        assert!(matches!(config.key_ring(), Err(RekeyError::Config(_))));
    }

    #[test]
    fn missing_keys() {
        assert!(matches!(
            DeploymentConfig::default().key_ring(),
            Err(RekeyError::Config(_))
        ));
        assert!(DeploymentConfig::from_value(json!([1])).is_err());
    }

    #[test]
    fn hash_key_version_forms() {
        let mut config = DeploymentConfig::default();
        assert_eq!(config.hash_key_version().unwrap(), None);
        config.set(paths::CRYPT_HASH_KEY_VERSION, json!(1)).unwrap();
        assert_eq!(config.hash_key_version().unwrap(), Some(1));
        config.set(paths::CRYPT_HASH_KEY_VERSION, json!("2")).unwrap();
        assert_eq!(config.hash_key_version().unwrap(), Some(2));
        config.set(paths::CRYPT_HASH_KEY_VERSION, json!("x")).unwrap();
        assert!(config.hash_key_version().is_err());
    }

    #[test]
    fn system_hash_tracks_segment() {
        let mut config = DeploymentConfig::from_value(json!({ "system": { "a": "1" } })).unwrap();
        config.regenerate_system_hash().unwrap();
        let first = config.get_str(paths::HASH_SYSTEM).unwrap().to_string();
        assert_eq!(first.len(), 64);

        config.set("system/a", json!("2")).unwrap();
        assert_ne!(config.system_hash().unwrap(), first);
        config.regenerate_system_hash().unwrap();
        assert_eq!(
            config.get_str(paths::HASH_SYSTEM),
            Some(config.system_hash().unwrap().as_str())
        );
    }

    #[test]
    fn decrypt_audit_flags() {
        let mut config = DeploymentConfig::default();
        assert_eq!(config.decrypt_audit(), DecryptAudit::default());
        config.set(paths::DECRYPT_LOGGING, json!("1")).unwrap();
        config.set(paths::DECRYPT_LOGGING_ONLY_OLD, json!(true)).unwrap();
        assert_eq!(
            config.decrypt_audit(),
            DecryptAudit {
                enabled: true,
                only_old_keys: true
            }
        );
    }
}
