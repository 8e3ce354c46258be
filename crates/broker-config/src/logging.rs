//! Logging initialization for the broker message core.
//!
//! Components only emit `tracing` events; this module decides where they go.
//! The subscriber writes compact lines to stderr, filtered by `RUST_LOG` or
//! the configured default level.

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// `RUST_LOG` takes precedence over `level` when set. Calling this more than
/// once is harmless: later calls leave the first subscriber installed.
///
/// # Example
///
/// ```ignore
/// broker_config::init_logging("info");
/// tracing::info!("message store opened");
/// ```
pub fn init_logging(level: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level_filter(level).into())
        .from_env_lossy();

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();

    if installed.is_ok() {
        tracing::debug!(default_level = %level, "logging initialized");
    }
}

/// Default filter level for a configured level name. Unknown names fall back
/// to `info`.
fn default_level_filter(level: &str) -> LevelFilter {
    LevelFilter::from_level(parse_level(level))
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
