//! Application configuration with layered loading.
//!
//! Loaded in this order (later overrides earlier): compiled defaults, a
//! TOML file named by the `PISA_CONFIG` env var, then `PISA_*` environment
//! variables (`PISA_PROVIDER__URL`, `PISA_CACHE__MAX_DEPTH`, ...).
//! Validation runs at load time; a nonsensical configuration fails fast
//! instead of surfacing downstream.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::responder::GasPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// JSON-RPC endpoint URL.
    #[serde(default = "default_provider_url")]
    pub url: String,

    /// Chain id of the network being watched.
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// Report the chain this many blocks behind the real tip. `0`
    /// disables the delay adapter.
    #[serde(default)]
    pub delay: u64,

    /// Seconds between tip polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_provider_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_chain_id() -> u64 {
    1
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_request_timeout_secs() -> u64 {
    10
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: default_provider_url(),
            chain_id: default_chain_id(),
            delay: 0,
            poll_interval_secs: default_poll_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Blocks retained behind the head. Also bounds how deep a reorg the
    /// pipeline can follow.
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,
}

fn default_max_depth() -> u64 {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_depth: default_max_depth() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    /// Replacement-pricing policy.
    #[serde(default)]
    pub gas: GasPolicy,

    /// Journal entries between queue snapshots.
    #[serde(default = "default_journal_snapshot_interval")]
    pub journal_snapshot_interval: u64,
}

fn default_journal_snapshot_interval() -> u64 {
    64
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            gas: GasPolicy::default(),
            journal_snapshot_interval: default_journal_snapshot_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory of the sled database.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String {
    "./pisa-data".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter, overridable via `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads the layered configuration: defaults, then the file named by
    /// `PISA_CONFIG` (if set), then `PISA_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Ok(path) = std::env::var("PISA_CONFIG") {
            builder = builder.add_source(File::with_name(&path));
        }
        let config: Self = builder
            .add_source(Environment::with_prefix("PISA").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads from an explicit file path plus environment overrides.
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("PISA").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_depth == 0 {
            return Err(ConfigError::Invalid("cache.max_depth must be positive".into()));
        }
        if self.provider.url.is_empty() {
            return Err(ConfigError::Invalid("provider.url must not be empty".into()));
        }
        if self.responder.gas.bump_factor <= 1.0 {
            return Err(ConfigError::Invalid("responder.gas.bump_factor must exceed 1.0".into()));
        }
        if self.responder.gas.max_gas_price < self.responder.gas.floor_gas_price {
            return Err(ConfigError::Invalid(
                "responder.gas.max_gas_price must be at least the floor".into(),
            ));
        }
        if self.responder.journal_snapshot_interval == 0 {
            return Err(ConfigError::Invalid(
                "responder.journal_snapshot_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
