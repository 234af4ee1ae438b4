//! # Request Distributor
//!
//! Picks the best connected, capable, free peer for one request attempt,
//! reserves a slot on it and sends the payload.
//!
//! Selection order: fewest active slots, then lowest measured round trip,
//! then least recently used for the same request key. Excluded peers and
//! peers at capacity are skipped.
//!
//! A [`DistributionSlot`] is the single owner of its peer slot from the
//! moment it is reserved, before anything is sent. It is released exactly
//! once: by [`DistributionSlot::finish`], or as abandoned when dropped,
//! including when a send is interrupted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{
    DispatchError, NodeId, PeerFilter, PeerInfo, RequestKey, SlotEvent, SlotId, SlotOutcome,
    TransportError,
};
use crate::ports::PeerConnection;
use crate::registry::{PeerRegistry, PeerSnapshot};

#[cfg(test)]
mod tests;

/// One attempt to place a request on a peer.
pub struct DispatchRequest<'a> {
    /// Logical request being served.
    pub key: RequestKey,
    /// Wire payload.
    pub payload: &'a [u8],
    /// Capability predicate.
    pub filter: &'a PeerFilter,
    /// Peers already tried for this key.
    pub excluded: &'a HashSet<NodeId>,
    /// When each peer was last used for this key.
    pub recent: &'a HashMap<NodeId, Instant>,
}

/// Selects peers and hands out distribution slots.
#[derive(Clone)]
pub struct RequestDistributor {
    registry: Arc<PeerRegistry>,
}

impl RequestDistributor {
    /// Create a distributor over `registry`.
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Registry this distributor draws peers from.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Eligible candidates for `request` in selection order.
    pub fn candidates(&self, request: &DispatchRequest<'_>) -> Vec<PeerSnapshot> {
        let unknown = self.registry.unknown_rtt();
        let mut candidates: Vec<PeerSnapshot> = self
            .registry
            .best_peers(request.filter)
            .filter(|peer| !request.excluded.contains(&peer.info.id) && peer.has_capacity())
            .collect();
        candidates.sort_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| a.rtt.unwrap_or(unknown).cmp(&b.rtt.unwrap_or(unknown)))
                .then_with(|| {
                    request
                        .recent
                        .get(&a.info.id)
                        .cmp(&request.recent.get(&b.info.id))
                })
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        candidates
    }

    /// Reserve a slot on the best eligible peer without sending.
    ///
    /// `NoPeerAvailable` is returned at once, without waiting.
    pub fn reserve(
        &self,
        request: &DispatchRequest<'_>,
    ) -> Result<DistributionSlot, DispatchError> {
        for candidate in self.candidates(request) {
            // Capacity may have been taken since the snapshot.
            if let Some(reservation) = self.registry.reserve(&candidate.info.id) {
                debug!(
                    key = %request.key,
                    peer = %reservation.info.id,
                    slot = %reservation.slot,
                    "[light] Slot reserved"
                );
                return Ok(DistributionSlot {
                    id: reservation.slot,
                    expected_rtt: reservation
                        .rtt
                        .unwrap_or_else(|| self.registry.unknown_rtt()),
                    conn: reservation.conn,
                    peer: reservation.info,
                    dispatched_at: Instant::now(),
                    registry: Arc::clone(&self.registry),
                    events: Some(reservation.events),
                    finished: false,
                });
            }
        }
        Err(DispatchError::NoPeerAvailable)
    }

    /// Reserve a slot on the best eligible peer and send the payload.
    ///
    /// On a send failure the slot is released before `SendFailed` is
    /// returned. Dropping the future mid-send releases the slot as abandoned.
    /// The send itself is unbounded; callers that need a bound race it
    /// against a timer.
    pub async fn dispatch(
        &self,
        request: &DispatchRequest<'_>,
    ) -> Result<DistributionSlot, DispatchError> {
        let mut slot = self.reserve(request)?;
        if let Err(e) = slot.send(request.payload).await {
            let peer = slot.peer().clone();
            slot.finish(SlotOutcome::SendFailed);
            return Err(DispatchError::SendFailed {
                peer: peer.id,
                address: peer.address,
                reason: e.to_string(),
            });
        }
        Ok(slot)
    }
}

/// One dispatch attempt bound to one peer.
pub struct DistributionSlot {
    id: SlotId,
    conn: Arc<dyn PeerConnection>,
    peer: PeerInfo,
    expected_rtt: Duration,
    dispatched_at: Instant,
    registry: Arc<PeerRegistry>,
    events: Option<oneshot::Receiver<SlotEvent>>,
    finished: bool,
}

impl DistributionSlot {
    /// Slot handle (wire request id).
    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Peer the request went to.
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Peer round trip at dispatch, or the unknown estimate.
    pub fn expected_rtt(&self) -> Duration {
        self.expected_rtt
    }

    /// When the payload was sent, or the slot reserved if not yet sent.
    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }

    /// Send `payload` tagged with this slot's id.
    ///
    /// Cancel-safe with respect to the slot: if the future is dropped, the
    /// slot stays owned and is released when the slot is.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        debug!(peer = %self.peer.id, slot = %self.id, "[light] Sending request");
        self.dispatched_at = Instant::now();
        self.conn.send(self.id, payload).await
    }

    /// Wait for the response or the peer-gone notice.
    ///
    /// Cancel-safe: dropping the future keeps the slot waiting.
    pub async fn wait(&mut self) -> SlotEvent {
        let Some(events) = self.events.as_mut() else {
            return SlotEvent::PeerGone;
        };
        let event = events.await.unwrap_or(SlotEvent::PeerGone);
        self.events = None;
        event
    }

    /// Release the slot with its terminal outcome. Returns time since dispatch.
    pub fn finish(mut self, outcome: SlotOutcome) -> Duration {
        self.finished = true;
        self.registry.release(self.id, outcome);
        self.dispatched_at.elapsed()
    }
}

impl Drop for DistributionSlot {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.release(self.id, SlotOutcome::Abandoned);
        }
    }
}
