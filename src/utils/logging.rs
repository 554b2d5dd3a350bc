//! Structured logging setup.
//!
//! The library itself only emits `tracing` events. Binaries and tests that
//! want them printed call [`init_logging`] once at startup.

use crate::config::LoggingConfig;
use crate::error::{NetError, Result};
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber built from `config`.
///
/// `RUST_LOG` takes precedence over the configured level when set. Fails if a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| NetError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, "Logging initialized");
    Ok(())
}
