//! TOML configuration of the engine and the built-in connector.

use std::fs;
use std::io;
use std::path::Path;

use derive_more::{Display, Error, From};

use crate::retry::RetryPolicy;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "snap-backup.toml";

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// Complete configuration file.
pub struct Config {
    /// Configuration of the snapshot engine.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Configuration of the [`LocalDir`](crate::connector::LocalDir) connector.
    #[serde(default)]
    pub local: LocalConfig,
}

/// Scheduling and retry behaviour of a snapshot run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Items processed concurrently. `1` processes strictly in order.
    pub workers: usize,

    /// Policy for fetching a single item.
    pub fetch: RetryPolicy,

    /// Policy for listing all items of an account.
    pub listing: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            fetch: RetryPolicy::short(),
            listing: RetryPolicy::long(),
        }
    }
}

/// Settings of the local directory connector.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Content type directory the files are stored under.
    pub content_type: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            content_type: "files".to_string(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on loading the configuration.
pub enum ConfigError {
    /// The file exists but can't be read.
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    /// The file is not valid TOML for [Config].
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
}

impl Config {
    /// Parse the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults, which are
    /// written to `path` for later editing.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Read(e)) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let config = Self::default();
                match toml::to_string_pretty(&config) {
                    Ok(content) => {
                        if let Err(e) = fs::write(path, content) {
                            log::warn!(target: "config", "Writing default config to {} failed {e}", path.display());
                        }
                    }
                    Err(e) => log::warn!(target: "config", "Serializing default config failed: {e}"),
                }
                Ok(config)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap-backup.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap-backup.toml");
        fs::write(
            &path,
            "[engine]\nworkers = 4\n\n[engine.fetch]\nmax_attempts = 7\ntimeout_ms = 1000\n",
        )
        .unwrap();

        let config = Config::load_or_init(&path).unwrap();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.fetch.max_attempts, 7);
        assert_eq!(config.engine.fetch.timeout_ms, Some(1000));
        assert_eq!(config.engine.fetch.multiplier, 2.0);
        assert_eq!(config.engine.listing, RetryPolicy::long());
        assert_eq!(config.local.content_type, "files");
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap-backup.toml");
        fs::write(&path, "[engine\nworkers = ").unwrap();

        assert!(matches!(
            Config::load_or_init(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
