//! Configuration and logging setup for the broker message core.

mod config;
mod error;
mod logging;

pub use config::{
    CacheConfig, Config, StoreConfig, DEFAULT_CACHE_MAX_BYTES, DEFAULT_CACHE_MAX_ENTRIES,
    DEFAULT_LOG_LEVEL,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::{init_logging, parse_level};
