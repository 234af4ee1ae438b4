//! # Light Client Retrieval Core
//!
//! Fetches chain data on demand from a dynamic set of full-node servers and
//! relays locally created transactions to them.
//!
//! ## Components
//!
//! | Module | Role |
//! |--------|------|
//! | [`registry`] | Connected servers, their in-flight slots and response correlation |
//! | [`server_pool`] | Persistent known-server records, failure cooldown, dial ranking |
//! | [`distributor`] | Picks the best peer with spare capacity and sends one request |
//! | [`retriever`] | Deduplicated, validated, retried retrieval with cancellation |
//! | [`odr`] | Typed chain-data requests verified against their commitments |
//! | [`relay`] | Best-effort transaction fan-out |
//! | [`application`] | Backend wiring and the block-producer sync gate |
//!
//! ## Architecture
//!
//! Hexagonal layout:
//! - **Domain Layer:** value objects, entities, invariants and errors
//! - **Ports Layer:** transport, persistence, validation and producer traits
//! - **Application Layer:** components wired around one shared registry
//!
//! ## Example
//!
//! ```rust,ignore
//! use light_retrieval::{LightBackend, OdrRequest, RetrievalConfig};
//!
//! let backend = LightBackend::new(RetrievalConfig::default())?;
//! backend.start()?;
//! backend.register_peer(connection)?;
//!
//! let header = backend.odr().header(block_hash).await?;
//! backend.stop().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod application;
pub mod config;
pub mod distributor;
pub mod domain;
pub mod odr;
pub mod ports;
pub mod registry;
pub mod relay;
pub mod retriever;
pub mod server_pool;

/// Scriptable peers and clocks for tests.
pub mod testing;

// Re-exports
pub use application::{LightBackend, ProducerGate, SyncEvent, WatchExit};
pub use config::{
    DistributorConfig, RelayConfig, RetrievalConfig, RetrieveConfig, ServerPoolConfig,
};
pub use distributor::{DispatchRequest, DistributionSlot, RequestDistributor};
pub use domain::*;
pub use odr::{encode_receipts, receipts_root, LightOdr, OdrRequest, OdrResponse};
pub use ports::*;
pub use registry::{PeerRegistry, PeerSnapshot};
pub use relay::{RelayReport, TxRelay};
pub use retriever::{Outcome, Phase, RetrieveManager, RetrieveRequest, RetrieveStats, Waiter};
pub use server_pool::{JsonFileStore, MemoryStore, ServerPool};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
