//! Logging setup for Roost binaries and tests.
//!
//! `RUST_LOG` wins when set; otherwise the configured `[logging] level` is
//! used as the filter directive.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;
use crate::error::RoostError;

/// Build the filter for `config`, preferring `RUST_LOG` when present.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber was already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), RoostError> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(fmt_layer)
        .try_init()
        .map_err(|e| RoostError::Logging(e.to_string()))
}
