//! Tracing subscriber setup.
//!
//! Installs a global `tracing` subscriber with an [`EnvFilter`] and either a
//! pretty console layer (development) or a JSON layer (containers, log
//! shipping).

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{TelemetryConfig, TelemetryError};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when both are present. Fails if
/// a global subscriber is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| TelemetryError::Config(e.to_string()))?;

    if config.json_logs {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .try_init()
            .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(config.with_source_location)
            .with_line_number(config.with_source_location)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;
    }

    Ok(())
}
