//! Configuration management for the AkiDB storage service
//!
//! Sources, lowest precedence first:
//! 1. Hardcoded defaults
//! 2. File named by `AKIDB_CONFIG` (TOML or YAML, by extension)
//! 3. `./config/akidb.{toml,yaml}`
//! 4. Environment variables, e.g. `AKIDB__STORAGE__RETRY__MAX_RETRIES=8`

use akidb_storage::{StorageConfig, TieringPolicyConfig};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AkidbConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub tiering: TieringPolicyConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tier state database
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetadataConfig {
    /// SQLite URL (default: "sqlite://akidb.db")
    pub database_url: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://akidb.db".to_string(),
        }
    }
}

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Full,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (default: "info")
    pub level: String,

    pub format: LogFormat,

    /// Include the module path of each event (default: true)
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            with_target: true,
        }
    }
}

impl AkidbConfig {
    /// Loads and validates the configuration from every source.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults(Config::builder())?;

        if let Ok(config_path) = std::env::var("AKIDB_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/akidb").required(false))
            .add_source(
                Environment::with_prefix("AKIDB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: AkidbConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a single configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: AkidbConfig = Self::set_defaults(Config::builder())?
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("storage.data_dir", "./data")?
            .set_default("metadata.database_url", "sqlite://akidb.db")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")
    }

    /// Rejects values the engine cannot start with. Runs before any worker.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;
        self.tiering
            .validate()
            .map_err(|e| ConfigError::Message(e.to_string()))?;

        if self.metadata.database_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "metadata.database_url must not be empty".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Message(
                "logging.level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
