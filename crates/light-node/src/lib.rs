//! # Light Node Runtime
//!
//! Configuration loading and backend assembly for the `light-node` binary.
//!
//! ## Configuration
//!
//! A single TOML file with three optional sections:
//!
//! ```toml
//! seed_servers = ["10.0.0.1:30303", "10.0.0.2:30303"]
//!
//! [retrieval.retrieve]
//! request_deadline_ms = 20000
//!
//! [retrieval.server_pool]
//! store_path = "/var/lib/light-node/servers.json"
//!
//! [telemetry]
//! log_level = "debug"
//! ```
//!
//! The file is taken from the command line, else from `LIGHT_CONFIG`. Without
//! either, defaults apply.

#![warn(missing_docs)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use light_retrieval::{LightBackend, RetrievalConfig, ServerAddr};
use light_telemetry::TelemetryConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LIGHT_CONFIG";

/// Node configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Retrieval core settings.
    pub retrieval: RetrievalConfig,
    /// Logging settings.
    pub telemetry: TelemetryConfig,
    /// Server addresses known before any persisted pool is loaded.
    pub seed_servers: Vec<String>,
}

impl NodeConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text).context("invalid node configuration")?;
        config
            .retrieval
            .validate()
            .context("invalid retrieval configuration")?;
        Ok(config)
    }
}

/// Resolve the config path from an explicit argument or `LIGHT_CONFIG`.
pub fn config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

/// Load the node configuration from `path`, or defaults when `None`.
pub fn load_config(path: Option<&Path>) -> Result<NodeConfig> {
    let Some(path) = path else {
        return Ok(NodeConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    NodeConfig::from_toml(&text).with_context(|| format!("in config file {}", path.display()))
}

/// Build the backend, seed its server pool and start it.
pub fn build_backend(config: &NodeConfig) -> Result<LightBackend> {
    let backend = LightBackend::new(config.retrieval.clone())?;
    let mut seeded = 0usize;
    for seed in &config.seed_servers {
        if backend.server_pool().add_server(ServerAddr::new(seed.as_str())) {
            seeded += 1;
        }
    }
    backend.start().context("failed to load server pool")?;
    info!(seeded, servers = backend.server_pool().len(), "[light] Backend ready");
    Ok(backend)
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(None).unwrap();
        assert!(config.seed_servers.is_empty());
        assert_eq!(config.retrieval, RetrievalConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            seed_servers = ["10.0.0.1:30303"]

            [retrieval.retrieve]
            request_deadline_ms = 5000

            [telemetry]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.seed_servers, vec!["10.0.0.1:30303".to_string()]);
        assert_eq!(config.retrieval.retrieve.request_deadline_ms, 5000);
        assert_eq!(
            config.retrieval.retrieve.max_attempts,
            RetrievalConfig::default().retrieve.max_attempts
        );
        assert_eq!(config.telemetry.log_level, "debug");
        assert_eq!(config.telemetry.service_name, "light-node");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = NodeConfig::from_toml(
            r#"
            [retrieval.distributor]
            default_capacity = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "seed_servers = [\"192.168.1.5:30303\"]").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.seed_servers.len(), 1);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/light.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = PathBuf::from("/etc/light.toml");
        assert_eq!(config_path(Some(explicit.clone())), Some(explicit));
    }

    #[tokio::test]
    async fn test_build_backend_seeds_pool() {
        let mut config = NodeConfig::default();
        config.retrieval = RetrievalConfig::for_testing();
        config.seed_servers = vec!["10.0.0.1:30303".into(), "10.0.0.1:30303".into()];

        let backend = build_backend(&config).unwrap();
        assert_eq!(backend.server_pool().len(), 1);
        backend.stop().await.unwrap();
    }

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
