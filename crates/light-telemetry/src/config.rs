//! Telemetry configuration from environment variables or the node config file.

use serde::{Deserialize, Serialize};
use std::env;

/// Configuration for logging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name attached to log records
    pub service_name: String,

    /// Log level filter (trace, debug, info, warn, error or a full directive)
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Whether to include file and line in log records
    pub with_source_location: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "light-node".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            with_source_location: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `LIGHT_SERVICE_NAME`: Service name (default: light-node)
    /// - `LIGHT_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `LIGHT_JSON_LOGS`: Enable JSON logs (default: true inside containers)
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment overrides on top of an existing configuration.
    pub fn with_env_overrides(mut self) -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        if let Ok(name) = env::var("LIGHT_SERVICE_NAME") {
            self.service_name = name;
        }
        if let Ok(level) = env::var("LIGHT_LOG_LEVEL").or_else(|_| env::var("RUST_LOG")) {
            self.log_level = level;
        }
        self.json_logs = env::var("LIGHT_JSON_LOGS")
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(self.json_logs || is_container);
        self
    }
}
