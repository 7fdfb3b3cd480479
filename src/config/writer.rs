use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RekeyError, Result};

use super::deployment::DeploymentConfig;

/// Persistence seam for deployment configuration.
pub trait ConfigWriter {
    /// Re-read the current persisted state.
    fn load(&self) -> Result<DeploymentConfig>;

    fn save(&self, config: &DeploymentConfig) -> Result<()>;
}

/// Pretty-printed JSON file, replaced atomically on save.
pub struct JsonFileWriter {
    path: PathBuf,
}

impl JsonFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> Result<PathBuf> {
        let name = self
            .path
            .file_name()
            .ok_or_else(|| RekeyError::Config(format!("{} is not a file", self.path.display())))?;
        let mut tmp = name.to_os_string();
        tmp.push(".tmp");
        Ok(self.path.with_file_name(tmp))
    }
}

impl ConfigWriter for JsonFileWriter {
    fn load(&self) -> Result<DeploymentConfig> {
        DeploymentConfig::load(&self.path)
    }

    fn save(&self, config: &DeploymentConfig) -> Result<()> {
        let tmp_path = self.temp_path()?;
        let mut bytes = serde_json::to_vec_pretty(config.as_value())?;
        bytes.push(b'\n');
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        // Atomic replace.
        fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), "saved deployment configuration");
        Ok(())
    }
}

/// In-memory configuration store.
#[derive(Default)]
pub struct MemoryWriter {
    config: Mutex<DeploymentConfig>,
    saves: Mutex<usize>,
}

impl MemoryWriter {
    pub fn new(config: DeploymentConfig) -> Self {
        Self {
            config: Mutex::new(config),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> DeploymentConfig {
        self.config.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl ConfigWriter for MemoryWriter {
    fn load(&self) -> Result<DeploymentConfig> {
        Ok(self.config.lock().clone())
    }

    fn save(&self, config: &DeploymentConfig) -> Result<()> {
        *self.config.lock() = config.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_file_round_trip_keeps_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.json");
        fs::write(&path, r#"{"z": 1, "crypt": {"key": "k"}, "a": 2}"#).unwrap();

        let writer = JsonFileWriter::new(&path);
        let mut config = writer.load().unwrap();
        config.set("crypt/key", json!("k2")).unwrap();
        writer.save(&config).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let z = text.find("\"z\"").unwrap();
        let crypt = text.find("\"crypt\"").unwrap();
        let a = text.find("\"a\"").unwrap();
        assert!(z < crypt && crypt < a);
        assert_eq!(writer.load().unwrap().get_str("crypt/key"), Some("k2"));
        assert!(!dir.path().join("env.json.tmp").exists());
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let writer = JsonFileWriter::new(dir.path().join("absent.json"));
        assert!(matches!(writer.load(), Err(RekeyError::Config(_))));
    }

    #[test]
    fn memory_writer_counts_saves() {
        let writer = MemoryWriter::default();
        let mut config = writer.load().unwrap();
        config.set("a/b", json!(1)).unwrap();
        writer.save(&config).unwrap();
        assert_eq!(writer.save_count(), 1);
        assert_eq!(writer.snapshot().get("a/b"), Some(&json!(1)));
    }
}
