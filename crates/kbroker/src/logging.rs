//! Tracing subscriber setup
//!
//! Library components never install a subscriber; they log through the span
//! their owner hands them. Binaries call [`init`] once at startup.

use crate::config::LoggingConfig;
use crate::error::ConfigError;
use tracing::info;
use tracing_subscriber::{
    Registry, filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. Output goes to stderr,
/// as JSON lines when `config.json` is set.
///
/// # Errors
///
/// [`ConfigError::Logging`] for an unparseable level, or when a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    let env_filter = env_filter(config)?;

    if config.json {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .json();

        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))?;
    } else {
        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false);

        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| ConfigError::Logging(e.to_string()))?;
    }

    info!(level = %config.level, json = config.json, "logging initialized");
    Ok(())
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::Logging(format!("Invalid log level: {e}")))
}
