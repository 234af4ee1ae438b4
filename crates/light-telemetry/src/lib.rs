//! # Light Telemetry
//!
//! Logging and metrics for the light-client node.
//!
//! ## Components
//!
//! - **Logs**: `tracing` subscriber with an env filter and either pretty or
//!   JSON output
//! - **Metrics**: Prometheus counters and gauges for peer, retrieval and
//!   relay activity, encodable as text for a scrape endpoint
//!
//! ## Usage
//!
//! ```rust,ignore
//! use light_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env())?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `LIGHT_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `LIGHT_JSON_LOGS` | `false` (`true` in containers) | JSON formatted logs |
//! | `LIGHT_SERVICE_NAME` | `light-node` | Service name in log records |

#![warn(missing_docs)]

mod config;
pub mod metrics;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{encode_metrics, register_metrics, MetricsHandle};
pub use tracing_setup::init_tracing;

use thiserror::Error;

/// Telemetry initialization errors.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The tracing subscriber could not be installed.
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracerInit(String),

    /// Metric registration or encoding failed.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = register_metrics()?;
    init_tracing(&config)?;

    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Telemetry initialized"
    );

    Ok(TelemetryGuard { _metrics: metrics })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
