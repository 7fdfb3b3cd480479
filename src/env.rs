//! Report environment-supplied configuration values still under old keys.
//!
//! The environment is passed in as a snapshot and never written to; whoever
//! manages the deployment environment applies the reported values.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::encryptor::SecretCipher;
use crate::envelope::is_stale;
use crate::error::Result;

const PLACEHOLDER_PREFIX: &str = "CONFIG__";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^CONFIG__[A-Za-z]+[A-Za-z0-9_]*$").expect("Invalid placeholder regex")
});

/// Is `name` an environment override for a configuration path?
pub fn is_placeholder(name: &str) -> bool {
    PLACEHOLDER.is_match(name)
}

/// `CONFIG__DEFAULT__PAYMENT__KEY` → `default/payment/key`.
pub fn placeholder_path(name: &str) -> Option<String> {
    if !is_placeholder(name) {
        return None;
    }
    let rest = name.strip_prefix(PLACEHOLDER_PREFIX)?;
    let path: Vec<String> = rest
        .split("__")
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect();
    (!path.is_empty()).then(|| path.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvChange {
    pub config_path: Option<String>,
    pub old_ciphertext: String,
    pub new_ciphertext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decrypted_preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvReport {
    /// Keyed by variable name.
    pub changes: BTreeMap<String, EnvChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<EnvFailure>,
}

impl EnvReport {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.failures.is_empty()
    }
}

pub struct EnvReporter<'c, C: ?Sized> {
    cipher: &'c C,
    show_decrypted: bool,
}

impl<'c, C: SecretCipher + ?Sized> EnvReporter<'c, C> {
    pub fn new(cipher: &'c C) -> Self {
        Self {
            cipher,
            show_decrypted: false,
        }
    }

    /// Include plaintext in the report.
    pub fn show_decrypted(mut self, show: bool) -> Self {
        self.show_decrypted = show;
        self
    }

    /// Old/new ciphertext for every placeholder variable under an old key.
    ///
    /// Undecryptable values are listed as failures; other errors abort.
    pub fn report<I, K, V>(&self, env: I) -> Result<EnvReport>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let latest = self.cipher.latest_version();
        let mut report = EnvReport::default();

        for (name, value) in env {
            let (name, value) = (name.as_ref(), value.as_ref());
            if !is_placeholder(name) || !is_stale(value, latest) {
                continue;
            }
            let plaintext = match self.cipher.decrypt(value) {
                Ok(p) => p,
                Err(e) if e.is_soft() => {
                    warn!(name, error = %e, "cannot decrypt environment value");
                    report.failures.push(EnvFailure {
                        name: name.to_string(),
                        error: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };
            let new_ciphertext = self.cipher.encrypt(&plaintext)?;
            debug!(name, "environment value needs re-encryption");
            report.changes.insert(
                name.to_string(),
                EnvChange {
                    config_path: placeholder_path(name),
                    old_ciphertext: value.to_string(),
                    new_ciphertext,
                    decrypted_preview: self.show_decrypted.then_some(plaintext),
                },
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryptor::test_support::{encrypt_at, ring};
    use crate::encryptor::Encryptor;
    use crate::error::RekeyError;

    #[test]
    fn placeholder_names() {
        assert!(is_placeholder("CONFIG__DEFAULT__PAYMENT__KEY"));
        assert!(is_placeholder("CONFIG__websites__base__x"));
        assert!(!is_placeholder("PATH"));
        assert!(!is_placeholder("CONFIG__"));
        assert!(!is_placeholder("CONFIG__1ABC"));
        assert_eq!(
            placeholder_path("CONFIG__DEFAULT__PAYMENT__KEY").as_deref(),
            Some("default/payment/key")
        );
        assert_eq!(
            placeholder_path("CONFIG__WEBSITES__BASE__CARRIERS__UPS__PASSWORD").as_deref(),
            Some("websites/base/carriers/ups/password")
        );
        assert_eq!(placeholder_path("HOME"), None);
    }

    #[test]
    fn reports_only_stale_placeholders() {
        let ring = ring(2);
        let enc = Encryptor::new(&ring);
        let current = enc.encrypt("new").unwrap();
        let env = vec![
            ("CONFIG__DEFAULT__PAYMENT__KEY", encrypt_at(0, "pay")),
            ("CONFIG__DEFAULT__FRESH", current),
            ("CONFIG__DEFAULT__PLAIN", "hello".to_string()),
            ("DATABASE_PASSWORD", encrypt_at(0, "db")),
        ];

        let report = EnvReporter::new(&enc).report(env).unwrap();
        assert_eq!(report.changes.len(), 1);
        let change = &report.changes["CONFIG__DEFAULT__PAYMENT__KEY"];
        assert_eq!(change.config_path.as_deref(), Some("default/payment/key"));
        assert!(change.new_ciphertext.starts_with("1:1:"));
        assert_eq!(enc.decrypt(&change.new_ciphertext).unwrap(), "pay");
        assert_eq!(change.decrypted_preview, None);
    }

    #[test]
    fn decrypted_preview_is_opt_in() {
        let ring = ring(2);
        let enc = Encryptor::new(&ring);
        let env = [("CONFIG__DEFAULT__A", encrypt_at(0, "secret"))];
        let report = EnvReporter::new(&enc).show_decrypted(true).report(env).unwrap();
        assert_eq!(
            report.changes["CONFIG__DEFAULT__A"].decrypted_preview.as_deref(),
            Some("secret")
        );
    }

    #[test]
    fn soft_failures_are_listed_fatal_abort() {
        let ring = ring(2);
        let enc = Encryptor::new(&ring);
        let env = [("CONFIG__DEFAULT__BROKEN", "0:1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA")];
        let report = EnvReporter::new(&enc).report(env).unwrap();
        assert!(report.changes.is_empty());
        assert_eq!(report.failures.len(), 1);

        let env = [("CONFIG__DEFAULT__UNKNOWN", "9:1:YWJjZA==")];
        assert!(matches!(
            EnvReporter::new(&enc).report(env),
            Err(RekeyError::UnknownKeyVersion(9))
        ));
    }
}
