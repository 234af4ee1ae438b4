//! # Retrieval Configuration
//!
//! Configuration for every component of the retrieval core. Durations are
//! stored as integer milliseconds so the structs round-trip through TOML.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{ConfigError, DEFAULT_FAILURE_THRESHOLD, DEFAULT_PEER_CAPACITY, LATENCY_EWMA_ALPHA};

/// Top-level configuration of the retrieval core.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Peer selection.
    pub distributor: DistributorConfig,
    /// Retry and timeout policy.
    pub retrieve: RetrieveConfig,
    /// Server reputation and persistence.
    pub server_pool: ServerPoolConfig,
    /// Transaction relay fan-out.
    pub relay: RelayConfig,
}

impl RetrievalConfig {
    /// Create a config for testing (short timeouts, no persistence).
    pub fn for_testing() -> Self {
        Self {
            distributor: DistributorConfig::for_testing(),
            retrieve: RetrieveConfig::for_testing(),
            server_pool: ServerPoolConfig::for_testing(),
            relay: RelayConfig::for_testing(),
        }
    }

    /// Reject values that would break selection or retry policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.distributor.default_capacity == 0 {
            return Err(invalid("distributor.default_capacity", "must be at least 1"));
        }
        let r = &self.retrieve;
        if r.request_deadline_ms == 0 {
            return Err(invalid("retrieve.request_deadline_ms", "must be positive"));
        }
        if !(r.max_attempt_share > 0.0 && r.max_attempt_share <= 1.0) {
            return Err(invalid("retrieve.max_attempt_share", "must be in (0, 1]"));
        }
        if !(r.latency_multiplier >= 0.0 && r.latency_multiplier.is_finite()) {
            return Err(invalid("retrieve.latency_multiplier", "must be a finite non-negative number"));
        }
        if r.max_attempts == 0 {
            return Err(invalid("retrieve.max_attempts", "must be at least 1"));
        }
        if r.registry_wait_slice_ms == 0 {
            return Err(invalid("retrieve.registry_wait_slice_ms", "must be positive"));
        }
        let p = &self.server_pool;
        if p.failure_threshold == 0 {
            return Err(invalid("server_pool.failure_threshold", "must be at least 1"));
        }
        if !(p.latency_ewma_alpha > 0.0 && p.latency_ewma_alpha <= 1.0) {
            return Err(invalid("server_pool.latency_ewma_alpha", "must be in (0, 1]"));
        }
        if p.max_cooldown_ms < p.base_cooldown_ms {
            return Err(invalid("server_pool.max_cooldown_ms", "must not be below base_cooldown_ms"));
        }
        if self.relay.seen_cache_size == 0 {
            return Err(invalid("relay.seen_cache_size", "must be at least 1"));
        }
        if self.relay.send_timeout_ms == 0 {
            return Err(invalid("relay.send_timeout_ms", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

/// Peer selection settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Concurrent requests per peer when the peer advertises none.
    pub default_capacity: u32,
    /// Round-trip estimate for peers without a measurement.
    pub unknown_rtt_ms: u64,
    /// Weight of the newest round-trip sample.
    pub rtt_ewma_alpha: f64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_PEER_CAPACITY,
            unknown_rtt_ms: 500,
            rtt_ewma_alpha: LATENCY_EWMA_ALPHA,
        }
    }
}

impl DistributorConfig {
    /// Create a config for testing.
    pub fn for_testing() -> Self {
        Self {
            default_capacity: 2,
            unknown_rtt_ms: 50,
            rtt_ewma_alpha: LATENCY_EWMA_ALPHA,
        }
    }

    /// Round-trip estimate for unmeasured peers.
    pub fn unknown_rtt(&self) -> Duration {
        Duration::from_millis(self.unknown_rtt_ms)
    }
}

/// Retry and timeout policy of the retrieve manager.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieveConfig {
    /// Fixed part of every per-attempt timeout.
    pub attempt_grace_ms: u64,
    /// Multiple of the peer's measured round trip added to the grace.
    pub latency_multiplier: f64,
    /// Largest fraction of the remaining budget one attempt may use.
    pub max_attempt_share: f64,
    /// Floor of the per-attempt timeout (still never beyond the deadline).
    pub min_attempt_timeout_ms: u64,
    /// Overall deadline of one logical retrieval.
    pub request_deadline_ms: u64,
    /// Maximum dispatch attempts of one logical retrieval.
    pub max_attempts: u32,
    /// Bound on one wait for a registry change.
    pub registry_wait_slice_ms: u64,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            attempt_grace_ms: 1_500,
            latency_multiplier: 3.0,
            max_attempt_share: 0.5,
            min_attempt_timeout_ms: 200,
            request_deadline_ms: 30_000,
            max_attempts: 16,
            registry_wait_slice_ms: 1_000,
        }
    }
}

impl RetrieveConfig {
    /// Create a config for testing.
    pub fn for_testing() -> Self {
        Self {
            attempt_grace_ms: 100,
            latency_multiplier: 3.0,
            max_attempt_share: 0.5,
            min_attempt_timeout_ms: 20,
            request_deadline_ms: 2_000,
            max_attempts: 8,
            registry_wait_slice_ms: 100,
        }
    }

    /// Fixed part of the per-attempt timeout.
    pub fn attempt_grace(&self) -> Duration {
        Duration::from_millis(self.attempt_grace_ms)
    }

    /// Floor of the per-attempt timeout.
    pub fn min_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.min_attempt_timeout_ms)
    }

    /// Overall deadline of one logical retrieval.
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    /// Bound on one wait for a registry change.
    pub fn registry_wait_slice(&self) -> Duration {
        Duration::from_millis(self.registry_wait_slice_ms)
    }

    /// Timeout of one attempt against a peer with round trip `rtt`, given
    /// `remaining` overall budget.
    ///
    /// `grace + multiplier * rtt`, capped at `max_attempt_share` of the
    /// remaining budget, floored at `min_attempt_timeout`, and never past
    /// the deadline.
    pub fn attempt_timeout(&self, rtt: Duration, remaining: Duration) -> Duration {
        let adaptive = self.attempt_grace() + rtt.mul_f64(self.latency_multiplier);
        let capped = adaptive.min(remaining.mul_f64(self.max_attempt_share));
        capped.max(self.min_attempt_timeout()).min(remaining)
    }
}

/// Server reputation and persistence settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerPoolConfig {
    /// Consecutive failures that start a cooldown.
    pub failure_threshold: u32,
    /// Cooldown at the threshold. Doubles per further failure.
    pub base_cooldown_ms: u64,
    /// Cooldown cap.
    pub max_cooldown_ms: u64,
    /// Weight of the newest latency sample.
    pub latency_ewma_alpha: f64,
    /// Latency used to rank unknown and stale records.
    pub unknown_latency_ms: u64,
    /// Records last seen longer ago than this load as unknown.
    pub stale_after_ms: u64,
    /// Period of the background flush.
    pub flush_interval_ms: u64,
    /// JSON file holding the records. `None` keeps them in memory only.
    pub store_path: Option<PathBuf>,
}

impl Default for ServerPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            base_cooldown_ms: 10_000,
            max_cooldown_ms: 30 * 60 * 1_000,
            latency_ewma_alpha: LATENCY_EWMA_ALPHA,
            unknown_latency_ms: 500,
            stale_after_ms: 7 * 24 * 60 * 60 * 1_000,
            flush_interval_ms: 60_000,
            store_path: None,
        }
    }
}

impl ServerPoolConfig {
    /// Create a config for testing.
    pub fn for_testing() -> Self {
        Self {
            base_cooldown_ms: 1_000,
            max_cooldown_ms: 60_000,
            stale_after_ms: 60 * 60 * 1_000,
            flush_interval_ms: 1_000,
            ..Self::default()
        }
    }

    /// Cooldown at the threshold.
    pub fn base_cooldown(&self) -> Duration {
        Duration::from_millis(self.base_cooldown_ms)
    }

    /// Cooldown cap.
    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    /// Period of the background flush.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Transaction relay settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Distinct peers each batch is sent to.
    pub fanout: usize,
    /// Transactions remembered with the peers they were sent to.
    pub seen_cache_size: usize,
    /// Longest a single relay send may take before the peer is skipped.
    pub send_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            seen_cache_size: 4096,
            send_timeout_ms: 5_000,
        }
    }
}

impl RelayConfig {
    /// Create a config for testing.
    pub fn for_testing() -> Self {
        Self {
            fanout: 2,
            seen_cache_size: 64,
            send_timeout_ms: 200,
        }
    }

    /// Per-peer send bound.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
