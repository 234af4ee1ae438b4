//! # Light Node
//!
//! Hosts the light-client retrieval core.
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (argument or `LIGHT_CONFIG`, else defaults)
//! 2. Initialize logging and metrics
//! 3. Build the backend, seed and load the server pool
//! 4. Run until Ctrl+C, then cancel retrievals and persist the pool

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};

use light_node::{build_backend, config_path, load_config, VERSION};
use light_telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path(std::env::args_os().nth(1).map(PathBuf::from));
    let config = load_config(path.as_deref())?;

    let telemetry = config.telemetry.clone().with_env_overrides();
    let _guard = init_telemetry(telemetry).context("failed to initialize telemetry")?;
    info!(version = VERSION, config = ?path, "Starting light node");

    let backend = build_backend(&config)?;

    info!("Node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    if let Err(e) = backend.stop().await {
        error!(error = %e, "Failed to persist server pool on shutdown");
    }
    Ok(())
}
