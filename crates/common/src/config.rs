use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "drift.toml";

/// Tunables for the profile store, the DHT client and the process engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Plaintext size of a content chunk in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// How many read-modify-write rounds a profile commit may take
    ///  before a version conflict becomes terminal
    #[serde(default = "default_max_commit_attempts")]
    pub max_commit_attempts: u32,
    /// Base delay between commit rounds, jittered
    #[serde(default = "default_commit_backoff_ms")]
    pub commit_backoff_ms: u64,
    /// Retries for a single DHT call that reported the network unavailable
    #[serde(default = "default_io_retries")]
    pub io_retries: u32,
    /// Base delay for the exponential DHT retry backoff
    #[serde(default = "default_io_backoff_ms")]
    pub io_backoff_ms: u64,
    /// Upper bound on a whole process, checked between steps.
    ///  No limit when unset
    #[serde(default)]
    pub process_timeout_secs: Option<u64>,
    /// How often a session re-runs a process from scratch after it
    ///  failed with a version conflict
    #[serde(default = "default_process_retries")]
    pub process_retries: u32,
}

fn default_chunk_size() -> usize {
    256 * 1024
}

fn default_max_commit_attempts() -> u32 {
    10
}

fn default_commit_backoff_ms() -> u64 {
    15
}

fn default_io_retries() -> u32 {
    3
}

fn default_io_backoff_ms() -> u64 {
    50
}

fn default_process_retries() -> u32 {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_commit_attempts: default_max_commit_attempts(),
            commit_backoff_ms: default_commit_backoff_ms(),
            io_retries: default_io_retries(),
            io_backoff_ms: default_io_backoff_ms(),
            process_timeout_secs: None,
            process_retries: default_process_retries(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        self.process_timeout_secs.map(Duration::from_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.max_commit_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_commit_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SyncConfig::from_toml("chunk_size = 1024\nprocess_timeout_secs = 30\n").unwrap();
        assert_eq!(config.chunk_size, 1024);
        assert_eq!(config.process_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_commit_attempts, default_max_commit_attempts());
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        assert!(matches!(
            SyncConfig::from_toml("chunk_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let config = SyncConfig {
            io_retries: 7,
            ..SyncConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
    }
}
