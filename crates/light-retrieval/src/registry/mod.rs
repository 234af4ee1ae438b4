//! # Peer Registry
//!
//! Tracks connected server peers, their load, round-trip estimate and the
//! distribution slots bound to them.
//!
//! ## Guarantees
//!
//! - Every mutation (add, remove, reserve, release) happens under one write
//!   lock, so a reader building a [`BestPeers`] snapshot never sees a peer
//!   that is mid-removal.
//! - Removing a peer fails every slot bound to it with
//!   [`SlotEvent::PeerGone`] before `remove` returns.
//! - Slots are indexed by [`SlotId`]; peers never hold references to
//!   pending requests.
//! - Every change bumps a generation counter observable through
//!   [`PeerRegistry::subscribe`].

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::DistributorConfig;
use crate::domain::{
    effective_capacity, ewma, invariant_capacity, NodeId, PeerFilter, PeerInfo, RegistryError,
    SlotEvent, SlotId, SlotOutcome,
};
use crate::ports::PeerConnection;


/// Point-in-time view of one registered peer.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    /// Handshake facts.
    pub info: PeerInfo,
    /// Active slots.
    pub in_flight: u32,
    /// Slots this peer accepts concurrently.
    pub capacity: u32,
    /// Measured round trip, if any.
    pub rtt: Option<Duration>,
    /// When the peer last had a slot reserved.
    pub last_used: Option<Instant>,
}

impl PeerSnapshot {
    /// Whether another slot may be reserved on this peer.
    pub fn has_capacity(&self) -> bool {
        invariant_capacity(self.in_flight, self.capacity)
    }
}

/// Lazy, restartable sequence of peers ordered by load then latency.
///
/// Built from one consistent snapshot. The capability filter is applied as
/// the sequence is consumed.
#[derive(Clone, Debug)]
pub struct BestPeers {
    peers: Arc<[PeerSnapshot]>,
    filter: PeerFilter,
    cursor: usize,
}

impl BestPeers {
    /// Rewind to the first peer.
    pub fn restart(&mut self) {
        self.cursor = 0;
    }
}

impl Iterator for BestPeers {
    type Item = PeerSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(peer) = self.peers.get(self.cursor) {
            self.cursor += 1;
            if peer.info.matches(&self.filter) {
                return Some(peer.clone());
            }
        }
        None
    }
}

/// A slot reserved on one peer. Must be handed to
/// [`PeerRegistry::release`] exactly once; the distributor wraps it in a
/// [`DistributionSlot`](crate::distributor::DistributionSlot) before any await.
pub(crate) struct Reservation {
    /// Slot handle, also the wire request id.
    pub slot: SlotId,
    /// Connection to send on.
    pub conn: Arc<dyn PeerConnection>,
    /// Peer facts at reservation time.
    pub info: PeerInfo,
    /// Round-trip estimate at reservation time.
    pub rtt: Option<Duration>,
    /// Receives the response or the peer-gone notice.
    pub events: oneshot::Receiver<SlotEvent>,
}

struct PeerEntry {
    conn: Arc<dyn PeerConnection>,
    info: PeerInfo,
    capacity: u32,
    in_flight: u32,
    rtt: Option<Duration>,
    last_used: Option<Instant>,
    slots: HashSet<SlotId>,
}

impl PeerEntry {
    fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            info: self.info.clone(),
            in_flight: self.in_flight,
            capacity: self.capacity,
            rtt: self.rtt,
            last_used: self.last_used,
        }
    }
}

struct SlotBinding {
    peer: NodeId,
    events: Option<oneshot::Sender<SlotEvent>>,
}

#[derive(Default)]
struct RegistryState {
    peers: HashMap<NodeId, PeerEntry>,
    slots: HashMap<SlotId, SlotBinding>,
}

/// Registry of connected peers.
pub struct PeerRegistry {
    config: DistributorConfig,
    state: RwLock<RegistryState>,
    changes: watch::Sender<u64>,
    next_slot: AtomicU64,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new(config: DistributorConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            config,
            state: RwLock::new(RegistryState::default()),
            changes,
            next_slot: AtomicU64::new(1),
        }
    }

    /// Register a peer whose handshake completed.
    pub fn add(&self, conn: Arc<dyn PeerConnection>) -> Result<(), RegistryError> {
        let info = conn.info().clone();
        let count = {
            let mut state = self.state.write();
            if state.peers.contains_key(&info.id) {
                return Err(RegistryError::DuplicateIdentity(info.id));
            }
            let capacity = effective_capacity(info.capacity, self.config.default_capacity);
            state.peers.insert(
                info.id,
                PeerEntry {
                    conn,
                    info: info.clone(),
                    capacity,
                    in_flight: 0,
                    rtt: None,
                    last_used: None,
                    slots: HashSet::new(),
                },
            );
            state.peers.len()
        };

        info!(
            peer = %info.id,
            address = %info.address,
            head = info.head_height,
            "[light] Peer registered"
        );
        light_telemetry::metrics::set_peers_connected(count);
        self.notify();
        Ok(())
    }

    /// Remove a peer, failing every slot bound to it with `PeerGone`.
    pub fn remove(&self, id: &NodeId) -> Result<PeerInfo, RegistryError> {
        let (entry, failed, count) = {
            let mut state = self.state.write();
            let entry = state
                .peers
                .remove(id)
                .ok_or(RegistryError::NotFound(*id))?;
            let mut failed = 0usize;
            for slot in &entry.slots {
                if let Some(binding) = state.slots.remove(slot) {
                    if let Some(events) = binding.events {
                        let _ = events.send(SlotEvent::PeerGone);
                        failed += 1;
                    }
                }
            }
            (entry, failed, state.peers.len())
        };

        info!(peer = %id, failed_slots = failed, "[light] Peer removed");
        light_telemetry::metrics::set_peers_connected(count);
        self.notify();
        Ok(entry.info)
    }

    /// Peers matching `filter`, least loaded first, then lowest round trip.
    pub fn best_peers(&self, filter: &PeerFilter) -> BestPeers {
        let unknown = self.config.unknown_rtt();
        let mut peers: Vec<PeerSnapshot> = {
            let state = self.state.read();
            state.peers.values().map(PeerEntry::snapshot).collect()
        };
        peers.sort_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then_with(|| a.rtt.unwrap_or(unknown).cmp(&b.rtt.unwrap_or(unknown)))
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        BestPeers {
            peers: peers.into(),
            filter: filter.clone(),
            cursor: 0,
        }
    }

    /// Reserve one slot on `id` if the peer is registered and below capacity.
    pub(crate) fn reserve(&self, id: &NodeId) -> Option<Reservation> {
        let mut state = self.state.write();
        let entry = state.peers.get_mut(id)?;
        if !invariant_capacity(entry.in_flight, entry.capacity) {
            return None;
        }

        let slot = SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        entry.in_flight += 1;
        entry.last_used = Some(Instant::now());
        entry.slots.insert(slot);
        let reservation = Reservation {
            slot,
            conn: Arc::clone(&entry.conn),
            info: entry.info.clone(),
            rtt: entry.rtt,
            events: rx,
        };
        state.slots.insert(
            slot,
            SlotBinding {
                peer: *id,
                events: Some(tx),
            },
        );
        Some(reservation)
    }

    /// Route a response from `peer` to the slot it answers.
    ///
    /// Returns `false` for stale responses: unknown or released slot, a slot
    /// bound to another peer, or a second response for the same slot.
    pub fn deliver(&self, peer: &NodeId, slot: SlotId, payload: Vec<u8>) -> bool {
        let mut state = self.state.write();
        let Some(binding) = state.slots.get_mut(&slot) else {
            debug!(peer = %peer, slot = %slot, "[light] Dropping response for unknown slot");
            return false;
        };
        if binding.peer != *peer {
            debug!(peer = %peer, slot = %slot, "[light] Dropping response from unbound peer");
            return false;
        }
        match binding.events.take() {
            Some(events) => events.send(SlotEvent::Response(payload)).is_ok(),
            None => {
                debug!(peer = %peer, slot = %slot, "[light] Dropping duplicate response");
                false
            }
        }
    }

    /// Release a slot. Returns `false` if it was already released or its
    /// peer is gone.
    pub fn release(&self, slot: SlotId, outcome: SlotOutcome) -> bool {
        let released = {
            let mut state = self.state.write();
            match state.slots.remove(&slot) {
                Some(binding) => {
                    if let Some(entry) = state.peers.get_mut(&binding.peer) {
                        entry.in_flight = entry.in_flight.saturating_sub(1);
                        entry.slots.remove(&slot);
                    }
                    true
                }
                None => false,
            }
        };
        if released {
            debug!(slot = %slot, outcome = outcome.label(), "[light] Slot released");
            self.notify();
        }
        released
    }

    /// Fold a round-trip sample into the peer's estimate.
    pub fn observe_latency(&self, id: &NodeId, sample: Duration) {
        let mut state = self.state.write();
        if let Some(entry) = state.peers.get_mut(id) {
            let previous = entry.rtt.map(|d| d.as_secs_f64());
            let next = ewma(previous, sample.as_secs_f64(), self.config.rtt_ewma_alpha);
            entry.rtt = Some(Duration::from_secs_f64(next.max(0.0)));
        }
    }

    /// Subscribe to change notifications (generation counter).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Snapshot of one peer.
    pub fn get(&self, id: &NodeId) -> Option<PeerSnapshot> {
        self.state.read().peers.get(id).map(PeerEntry::snapshot)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.read().peers.contains_key(id)
    }

    /// Registered peer ids.
    pub fn ids(&self) -> Vec<NodeId> {
        self.state.read().peers.keys().copied().collect()
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.state.read().peers.len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots currently bound across all peers.
    pub fn active_slots(&self) -> usize {
        self.state.read().slots.len()
    }

    /// Round-trip estimate for peers without a measurement.
    pub fn unknown_rtt(&self) -> Duration {
        self.config.unknown_rtt()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}
