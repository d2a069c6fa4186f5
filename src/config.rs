use crate::error::{PoolError, Result};
use serde::Deserialize;
use std::path::Path;

/// Application configuration loaded from a YAML file
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Local listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Embedded store configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Hunter discovery credentials
    #[serde(default)]
    pub hunter: ProviderCredentials,
    /// FOFA discovery credentials
    #[serde(default)]
    pub fofa: ProviderCredentials,
    /// Pool tuning knobs
    #[serde(default)]
    pub pool: PoolConfig,
    /// Offline geolocation database
    #[serde(default)]
    pub geo: GeoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind the proxy listener to
    pub host: String,
    /// Port for the proxy listener
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file (created on first open)
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "proxies.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderCredentials {
    /// API key; an empty key disables the provider
    pub api_key: String,
}

impl ProviderCredentials {
    pub fn enabled(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// How the rotator picks its working set from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    Random,
    #[default]
    Priority,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Random => "random",
            SelectionMode::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Working-set selection mode
    pub selection_mode: SelectionMode,
    /// Restrict the working set to upstreams located in China
    pub only_china: bool,
    /// Scheduler tick interval in seconds
    pub tick_seconds: u64,
    /// Below this many stored proxies a discovery run is triggered
    pub min_pool_size: i64,
    /// Priority added on a successful outcome
    pub priority_up_delta: i64,
    /// Priority subtracted on a failed outcome
    pub priority_down_delta: i64,
    /// Maximum number of upstreams in the rotator working set
    pub working_set_size: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            selection_mode: SelectionMode::Priority,
            only_china: false,
            tick_seconds: 60,
            min_pool_size: 50,
            priority_up_delta: 1,
            priority_down_delta: 10,
            working_set_size: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Path of the offline IP location database; enrichment is disabled
    /// when the file does not exist
    pub data_path: String,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            data_path: "data/czutf8.dat".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. A missing file is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|_| PoolError::ConfigMissing(path.display().to_string()))?;

        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| PoolError::InvalidConfig(format!("{}: {}", path.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(PoolError::InvalidConfig(
                "server.port must be nonzero".into(),
            ));
        }
        if self.pool.tick_seconds == 0 {
            return Err(PoolError::InvalidConfig(
                "pool.tick_seconds must be nonzero".into(),
            ));
        }
        if self.pool.working_set_size == 0 {
            return Err(PoolError::InvalidConfig(
                "pool.working_set_size must be nonzero".into(),
            ));
        }
        if self.pool.priority_up_delta < 0 || self.pool.priority_down_delta < 0 {
            return Err(PoolError::InvalidConfig(
                "priority deltas must be non-negative".into(),
            ));
        }
        Ok(())
    }

    /// Get the proxy listener address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
