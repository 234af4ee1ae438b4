//! # Test Utilities
//!
//! Scriptable peers, a block producer and a manual clock for unit and
//! integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::domain::{NodeId, PeerInfo, ServerAddr, SlotId, TransportError};
use crate::ports::{BlockProducer, Clock, PeerConnection};
use crate::registry::PeerRegistry;

/// Builds the response a [`MockPeer`] returns for a request payload.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// How a [`MockPeer`] reacts to a send.
#[derive(Clone)]
pub enum MockBehavior {
    /// Answer after `delay` with `responder(payload)`.
    Reply {
        /// Simulated round trip.
        delay: Duration,
        /// Response builder.
        responder: Responder,
    },
    /// Accept the send, never answer.
    Silent,
    /// Refuse the send.
    RejectSend,
    /// Never complete the send.
    HangSend,
}

impl MockBehavior {
    /// Answer with a fixed payload after `delay`.
    pub fn reply_with(response: Vec<u8>, delay: Duration) -> Self {
        MockBehavior::Reply {
            delay,
            responder: Arc::new(move |_| response.clone()),
        }
    }

    /// Answer with the output of `f` after `delay`.
    pub fn reply_fn<F>(delay: Duration, f: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        MockBehavior::Reply {
            delay,
            responder: Arc::new(f),
        }
    }
}

/// Scriptable peer connection that answers through the registry.
pub struct MockPeer {
    info: PeerInfo,
    registry: Weak<PeerRegistry>,
    behavior: Mutex<MockBehavior>,
    sends: AtomicUsize,
    sent: Mutex<Vec<(SlotId, Vec<u8>)>>,
}

impl MockPeer {
    /// Create a mock peer answering into `registry`.
    pub fn new(info: PeerInfo, registry: &Arc<PeerRegistry>, behavior: MockBehavior) -> Arc<Self> {
        Arc::new(Self {
            info,
            registry: Arc::downgrade(registry),
            behavior: Mutex::new(behavior),
            sends: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Change how later sends are answered.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Node id of this peer.
    pub fn id(&self) -> NodeId {
        self.info.id
    }

    /// Sends received so far.
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Request ids and payloads received so far.
    pub fn sent(&self) -> Vec<(SlotId, Vec<u8>)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn info(&self) -> &PeerInfo {
        &self.info
    }

    async fn send(&self, request_id: SlotId, payload: &[u8]) -> Result<(), TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().push((request_id, payload.to_vec()));

        let behavior = self.behavior.lock().clone();
        match behavior {
            MockBehavior::Reply { delay, responder } => {
                let response = responder(payload);
                let registry = self.registry.clone();
                let peer = self.info.id;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.deliver(&peer, request_id, response);
                    }
                });
                Ok(())
            }
            MockBehavior::Silent => Ok(()),
            MockBehavior::RejectSend => Err(TransportError::Rejected("mock rejects".to_string())),
            MockBehavior::HangSend => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

/// Node id whose first byte is `byte`.
pub fn node_id(byte: u8) -> NodeId {
    let mut id = [0u8; 32];
    id[0] = byte;
    NodeId::new(id)
}

/// Light-serving peer info for `node_id(byte)` at `10.0.0.<byte>:30303`.
pub fn peer_info(byte: u8) -> PeerInfo {
    PeerInfo::new(
        node_id(byte),
        ServerAddr::new(format!("10.0.0.{}:30303", byte)),
        2,
        1_000,
    )
}

/// Block producer that only counts its transitions.
#[derive(Debug, Default)]
pub struct MockProducer {
    producing: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockProducer {
    /// Times `start` was called.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Times `stop` was called.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl BlockProducer for MockProducer {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.producing.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.producing.store(false, Ordering::SeqCst);
    }

    fn is_producing(&self) -> bool {
        self.producing.load(Ordering::SeqCst)
    }
}

/// Clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Start at `now_ms` Unix milliseconds.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
