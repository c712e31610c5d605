//! Configuration file handling for shipit.
//!
//! This crate provides configuration loading from `.shipit.toml` files
//! with support for merging with CLI arguments and defaults.
//!
//! # Example
//!
//! ```
//! use shipit_config::{Config, load_config};
//! use std::path::Path;
//!
//! // Load config from a directory (looks for .shipit.toml)
//! let config = load_config(Path::new(".")).expect("load config");
//!
//! println!("store: {}", config.store_path().display());
//! println!("batch width: {}", config.max_concurrency());
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shipit_encrypt::{DEFAULT_KEY_ENV, EncryptionConfig, FieldCodec};

/// Default configuration file name
pub const CONFIG_FILE: &str = ".shipit.toml";

/// Default location of the store snapshot, relative to the project directory
pub const DEFAULT_STORE_PATH: &str = ".shipit/store.json";

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Complete shipit configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Field encryption settings
    #[serde(default)]
    encryption: EncryptionConfig,
    /// Reconciliation engine settings
    #[serde(default)]
    engine: EngineConfig,
    /// Store settings
    #[serde(default)]
    store: StoreConfig,
}

impl Config {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encryption(&self) -> &EncryptionConfig {
        &self.encryption
    }

    /// Operations dispatched at once inside one batch (at least 1)
    pub fn max_concurrency(&self) -> usize {
        self.engine.max_concurrency.max(1)
    }

    /// Upper bound on the transactional phase of one reconciliation
    pub fn transaction_timeout(&self) -> Duration {
        self.engine.transaction_timeout
    }

    pub fn store_path(&self) -> &Path {
        &self.store.path
    }

    /// Store path, with relative paths taken from `base`
    pub fn resolve_store_path(&self, base: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            base.join(&self.store.path)
        }
    }

    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.engine.max_concurrency = max_concurrency;
    }

    pub fn set_transaction_timeout(&mut self, timeout: Duration) {
        self.engine.transaction_timeout = timeout;
    }

    pub fn set_store_path(&mut self, path: impl Into<PathBuf>) {
        self.store.path = path.into();
    }

    pub fn set_encryption(&mut self, encryption: EncryptionConfig) {
        self.encryption = encryption;
    }

    /// Build the field codec for this configuration.
    ///
    /// With encryption disabled the codec still picks up a secret from
    /// `SHIPIT_ENCRYPT_KEY` when one is set; otherwise values pass through.
    pub fn field_codec(&self) -> Result<FieldCodec> {
        if self.encryption.enabled {
            return FieldCodec::new(&self.encryption);
        }

        match std::env::var(DEFAULT_KEY_ENV) {
            Ok(secret) if !secret.is_empty() => Ok(FieldCodec::with_passphrase(&secret)),
            _ => Ok(FieldCodec::passthrough()),
        }
    }

    /// Merge this config with another (other takes precedence)
    pub fn merge(&self, other: &Config) -> Config {
        Config {
            encryption: EncryptionConfig {
                enabled: other.encryption.enabled || self.encryption.enabled,
                passphrase: other
                    .encryption
                    .passphrase
                    .as_ref()
                    .or(self.encryption.passphrase.as_ref())
                    .cloned(),
                env_var: other
                    .encryption
                    .env_var
                    .as_ref()
                    .or(self.encryption.env_var.as_ref())
                    .cloned(),
            },
            engine: EngineConfig {
                max_concurrency: if other.engine.max_concurrency != default_max_concurrency() {
                    other.engine.max_concurrency
                } else {
                    self.engine.max_concurrency
                },
                transaction_timeout: if other.engine.transaction_timeout
                    != default_transaction_timeout()
                {
                    other.engine.transaction_timeout
                } else {
                    self.engine.transaction_timeout
                },
            },
            store: StoreConfig {
                path: if other.store.path != default_store_path() {
                    other.store.path.clone()
                } else {
                    self.store.path.clone()
                },
            },
        }
    }
}

/// Reconciliation engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_transaction_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            transaction_timeout: default_transaction_timeout(),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORE_PATH)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

/// Load configuration from a directory
pub fn load_config(dir: &Path) -> Result<Config> {
    load_config_from_file(&config_path(dir))
}

/// Load configuration from a specific file path
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Save configuration to a file
pub fn save_config(dir: &Path, config: &Config) -> Result<()> {
    let path = config_path(dir);

    let content = toml::to_string_pretty(config).context("failed to serialize config to TOML")?;

    std::fs::write(&path, content)
        .with_context(|| format!("failed to write config file: {}", path.display()))?;

    Ok(())
}

/// Find configuration file by walking up the directory tree
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;

    loop {
        let config_file = current.join(CONFIG_FILE);
        if config_file.exists() {
            return Some(config_file);
        }

        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}
