//! Structured logging infrastructure for Trustbind.
//!
//! This module provides centralized logging initialization with support
//! for structured JSON output and environment-based configuration.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Initialize the logging system with structured output.
///
/// Log level can be configured via the `RUST_LOG` environment variable.
/// If not set, defaults to `info` level.
///
/// # Example
/// ```no_run
/// use trustbind_core::logging;
///
/// logging::init();
/// tracing::info!("Agent started");
/// ```
pub fn init() {
    init_with(&LoggingConfig::default());
}

/// Initialize the logging system with JSON output for production environments.
///
/// # Example
/// ```no_run
/// use trustbind_core::logging;
///
/// logging::init_json();
/// tracing::info!(socket = "/tmp/agent.sock", "Workload endpoint listening");
/// ```
pub fn init_json() {
    init_with(&LoggingConfig {
        format: LogFormat::Json,
        ..LoggingConfig::default()
    });
}

/// Initialize logging from a configuration section. `RUST_LOG` still wins
/// over the configured level when set.
pub fn init_with(config: &LoggingConfig) {
    let filter = env_filter(&config.level);
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init(),
    }
}

const FALLBACK_LEVEL: &str = "info";

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(default_level))
}

/// Filter for a configured level, or `info` if it does not parse.
fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}
