//! # Outbound Ports
//!
//! Traits for external collaborators: peer transport, server-record
//! persistence, response validation, wall clock and the block producer.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::{PeerInfo, ServerAddr, ServerPoolError, ServerRecord, SlotId, TransportError};

/// A connected server peer - outbound port.
///
/// The handshake and wire codec live behind this trait. Responses come back
/// through [`crate::LightBackend::deliver`] tagged with the request id passed
/// to [`PeerConnection::send`].
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Facts learned at handshake.
    fn info(&self) -> &PeerInfo;

    /// Send one request. `Ok` only acknowledges local submission.
    async fn send(&self, request_id: SlotId, payload: &[u8]) -> Result<(), TransportError>;
}

/// Durable storage for server records - outbound port.
pub trait ServerPoolStore: Send + Sync {
    /// Load every persisted record. An absent store yields an empty map.
    fn load(&self) -> Result<BTreeMap<ServerAddr, ServerRecord>, ServerPoolError>;

    /// Replace the persisted records.
    fn save(&self, records: &BTreeMap<ServerAddr, ServerRecord>) -> Result<(), ServerPoolError>;
}

/// Caller-supplied validation predicate for a response payload.
pub trait ResponseValidator: Send + Sync {
    /// `Err` carries a short reason for logs.
    fn validate(&self, response: &[u8]) -> Result<(), String>;
}

impl<F> ResponseValidator for F
where
    F: Fn(&[u8]) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, response: &[u8]) -> Result<(), String> {
        self(response)
    }
}

/// Wall clock for persisted timestamps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_unix_ms(&self) -> u64;
}

/// System wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Local block producer - outbound port.
///
/// Only start/stop matter here; production itself is out of scope.
pub trait BlockProducer: Send + Sync {
    /// Begin producing blocks.
    fn start(&self);

    /// Stop producing blocks.
    fn stop(&self);

    /// Whether the producer is currently running.
    fn is_producing(&self) -> bool;
}
