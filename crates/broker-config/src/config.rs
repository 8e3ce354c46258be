//! Configuration for the broker message core.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default number of reclaimable slots kept in memory across all messages.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 65_536;

/// Default byte budget for cached content (64 MiB).
pub const DEFAULT_CACHE_MAX_BYTES: usize = 64 * 1024 * 1024;

const ENV_LOG_LEVEL: &str = "BROKER_LOG_LEVEL";
const ENV_CACHE_MAX_ENTRIES: &str = "BROKER_CACHE_MAX_ENTRIES";
const ENV_CACHE_MAX_BYTES: &str = "BROKER_CACHE_MAX_BYTES";
const ENV_STORE_PATH: &str = "BROKER_STORE_PATH";

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bounds for the reclaimable message cache.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Message store location.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Bounds for the reclaimable message cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached slots (headers, publish descriptors, chunks).
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Maximum total weight of cached slots in bytes.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: usize,
}

/// Message store location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file. `None` keeps the store in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_cache_max_entries() -> usize {
    DEFAULT_CACHE_MAX_ENTRIES
}

fn default_cache_max_bytes() -> usize {
    DEFAULT_CACHE_MAX_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            cache: CacheConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            max_bytes: DEFAULT_CACHE_MAX_BYTES,
        }
    }
}

impl Config {
    /// Create a new Config with default values, then override from environment.
    pub fn new() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.load_from_env()?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist. Environment variables override file values.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    fn load_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };

        config.apply_overrides(lookup)?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Rejects bounds that would make the cache unusable.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be greater than zero".to_string(),
            ));
        }
        if self.cache.max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Override configuration from environment variables.
    fn load_from_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(log_level) = lookup(ENV_LOG_LEVEL).and_then(non_empty) {
            self.log_level = log_level;
        }
        if let Some(raw) = lookup(ENV_CACHE_MAX_ENTRIES).and_then(non_empty) {
            self.cache.max_entries = parse_usize(ENV_CACHE_MAX_ENTRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CACHE_MAX_BYTES).and_then(non_empty) {
            self.cache.max_bytes = parse_usize(ENV_CACHE_MAX_BYTES, &raw)?;
        }
        if let Some(path) = lookup(ENV_STORE_PATH).and_then(non_empty) {
            self.store.path = Some(PathBuf::from(path));
        }
        Ok(())
    }
}

fn non_empty(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_usize(name: &str, raw: &str) -> ConfigResult<usize> {
    raw.parse::<usize>()
        .map_err(|e| ConfigError::Invalid(format!("{name}={raw:?}: {e}")))
}
