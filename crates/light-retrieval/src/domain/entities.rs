//! # Domain Entities
//!
//! Peer facts, slot outcomes, attempt history and relayable transactions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::value_objects::{Hash, NodeId, PeerFilter, ServerAddr};

/// Facts about a connected server learned at handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// Stable identity.
    pub id: NodeId,
    /// Address the connection was made to (key into the server pool).
    pub address: ServerAddr,
    /// Negotiated protocol version.
    pub protocol_version: u32,
    /// Advertised head height.
    pub head_height: u64,
    /// Declared number of concurrent requests this peer accepts (0 = unspecified).
    pub capacity: u32,
    /// Whether the peer serves light-client requests.
    pub serves_light: bool,
}

impl PeerInfo {
    /// Create peer info with light serving enabled and unspecified capacity.
    pub fn new(id: NodeId, address: ServerAddr, protocol_version: u32, head_height: u64) -> Self {
        Self {
            id,
            address,
            protocol_version,
            head_height,
            capacity: 0,
            serves_light: true,
        }
    }

    /// Set the declared concurrent-request capacity.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Check this peer against a capability filter.
    pub fn matches(&self, filter: &PeerFilter) -> bool {
        self.head_height >= filter.min_head_height
            && self.protocol_version >= filter.min_protocol_version
            && (!filter.require_light_serving || self.serves_light)
    }
}

/// What the owner of a distribution slot observes while waiting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotEvent {
    /// The peer answered with this payload.
    Response(Vec<u8>),
    /// The peer was removed from the registry before answering.
    PeerGone,
}

/// Terminal outcome of one distribution slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotOutcome {
    /// Response arrived and passed validation.
    DeliveredValid,
    /// Response arrived and failed validation.
    DeliveredInvalid,
    /// No response within the attempt timeout.
    TimedOut,
    /// The peer disconnected while the slot was active.
    PeerDisconnected,
    /// The slot owner stopped waiting (cancellation); a late response is discarded.
    Abandoned,
    /// The send itself failed.
    SendFailed,
    /// Fire-and-forget send completed (transaction relay).
    Relayed,
}

impl SlotOutcome {
    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            SlotOutcome::DeliveredValid => "valid",
            SlotOutcome::DeliveredInvalid => "invalid",
            SlotOutcome::TimedOut => "timeout",
            SlotOutcome::PeerDisconnected => "peer_gone",
            SlotOutcome::Abandoned => "abandoned",
            SlotOutcome::SendFailed => "send_failed",
            SlotOutcome::Relayed => "relayed",
        }
    }

    /// Whether this outcome counts against the peer.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            SlotOutcome::DeliveredInvalid
                | SlotOutcome::TimedOut
                | SlotOutcome::PeerDisconnected
                | SlotOutcome::SendFailed
        )
    }
}

/// One entry of a pending request's retry history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Peer the attempt went to.
    pub peer: NodeId,
    /// How the attempt ended.
    pub outcome: SlotOutcome,
    /// Time from dispatch to outcome.
    pub elapsed: Duration,
}

/// Persisted reputation entry for one candidate server address.
///
/// Scores move only on observed outcomes or an explicit operator reset.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Consecutive failed dials or requests.
    pub failure_streak: u32,
    /// Moving average of observed latency in milliseconds, if any.
    pub latency_ewma_ms: Option<f64>,
    /// Unix milliseconds of the last successful contact (0 = never).
    pub last_seen_ms: u64,
    /// Unix milliseconds of the most recent failure.
    #[serde(default)]
    pub last_failure_ms: Option<u64>,
    /// Loaded with a last-seen older than the staleness threshold. Ranked as
    /// unknown until the next observation.
    #[serde(skip)]
    pub stale: bool,
}

impl ServerRecord {
    /// Record a success with an optional latency sample.
    pub fn note_success(&mut self, latency: Option<Duration>, alpha: f64, now_ms: u64) {
        self.failure_streak = 0;
        self.last_seen_ms = now_ms;
        self.stale = false;
        if let Some(latency) = latency {
            let sample = latency.as_secs_f64() * 1000.0;
            let previous = self.latency_ewma_ms;
            self.latency_ewma_ms = Some(super::invariants::ewma(previous, sample, alpha));
        }
    }

    /// Record a failure. Returns the new streak.
    pub fn note_failure(&mut self, now_ms: u64) -> u32 {
        self.failure_streak = self.failure_streak.saturating_add(1);
        self.last_failure_ms = Some(now_ms);
        self.stale = false;
        self.failure_streak
    }

    /// Latency used for ranking. Unknown and stale records rank at `unknown_ms`.
    pub fn ranking_latency_ms(&self, unknown_ms: f64) -> f64 {
        if self.stale {
            return unknown_ms;
        }
        self.latency_ewma_ms.unwrap_or(unknown_ms)
    }

    /// Failure streak used for ranking. Stale records rank as fresh.
    pub fn ranking_streak(&self) -> u32 {
        if self.stale {
            0
        } else {
            self.failure_streak
        }
    }
}

/// A locally created transaction ready for relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction hash.
    pub hash: Hash,
    /// Encoded transaction.
    pub raw: Vec<u8>,
}

impl Transaction {
    /// Create a transaction whose hash is the SHA-256 of its encoding.
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            hash: super::value_objects::sha256(&raw),
            raw,
        }
    }
}
