//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod processing;
mod storage;

pub use messaging::{MessagingConfig, MessagingType, NatsConfig};
pub use processing::{ConsumerConfig, RetryConfig};
pub use storage::{SqliteConfig, StorageConfig, StorageType};

use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CQBUS_CONFIG";
/// Prefix for configuration environment variables (`CQBUS__RETRY__MAX_RETRIES`).
pub const CONFIG_ENV_PREFIX: &str = "CQBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CQBUS_LOG";
/// Environment variable selecting the log format (`json` or `pretty`).
pub const LOG_FORMAT_ENV_VAR: &str = "CQBUS_LOG_FORMAT";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Service identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service name, the second token of every subject the service owns.
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "projects".to_string(),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub messaging: MessagingConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub consumer: ConsumerConfig,
    /// Debug profile: single attempt, short delays.
    pub debug: bool,
    /// Local development; implies the debug retry profile.
    pub local: bool,
    /// Test run; implies the debug retry profile.
    pub is_test: bool,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("retry.delays_secs")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            is_test: true,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.is_empty() || self.service.name.contains(['.', '*', '>', ' ']) {
            return Err(ConfigError::Invalid(format!(
                "service.name {:?} is not a single subject token",
                self.service.name
            )));
        }
        if self.retry.max_retries == Some(0) {
            return Err(ConfigError::Invalid(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.consumer.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "consumer.max_in_flight must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the reduced retry profile applies.
    pub fn is_debug_profile(&self) -> bool {
        self.debug || self.local || self.is_test
    }

    /// Retry policy for this deployment: the profile default with any
    /// explicit overrides applied.
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = if self.is_debug_profile() {
            RetryPolicy::debug()
        } else {
            RetryPolicy::production()
        };

        let max_retries = self.retry.max_retries.unwrap_or(base.max_retries());
        let delays = match &self.retry.delays_secs {
            Some(secs) => secs.iter().copied().map(Duration::from_secs).collect(),
            None => base.delays().to_vec(),
        };

        RetryPolicy::new(max_retries, delays).with_error_policy(self.retry.error_policy)
    }

    /// Ack wait handed to every durable consumer.
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.consumer.ack_wait_secs)
    }
}

#[cfg(test)]
mod tests;
