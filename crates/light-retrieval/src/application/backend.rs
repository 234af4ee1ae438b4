//! # Light Backend
//!
//! Wires the registry, server pool, distributor, retrieve manager, ODR layer
//! and transaction relay around one shared peer registry, and exposes the
//! peer lifecycle entry points used by the connection layer. A host with a
//! local block producer hands it to [`LightBackend::gate_producer`] so
//! production pauses while the chain syncs.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::{ProducerGate, SyncEvent, WatchExit};
use crate::config::RetrievalConfig;
use crate::distributor::RequestDistributor;
use crate::domain::{
    ConfigError, NodeId, PeerInfo, RegistryError, ServerAddr, ServerPoolError, SlotId,
};
use crate::odr::LightOdr;
use crate::ports::{BlockProducer, PeerConnection};
use crate::registry::PeerRegistry;
use crate::relay::TxRelay;
use crate::retriever::RetrieveManager;
use crate::server_pool::ServerPool;

/// Light-client retrieval backend.
pub struct LightBackend {
    registry: Arc<PeerRegistry>,
    server_pool: Arc<ServerPool>,
    retriever: RetrieveManager,
    odr: LightOdr,
    relay: Arc<TxRelay>,
    shutdown: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    sync_watcher: Mutex<Option<JoinHandle<WatchExit>>>,
}

impl LightBackend {
    /// Build every component from `config`.
    pub fn new(config: RetrievalConfig) -> Result<Self, ConfigError> {
        let pool = Arc::new(ServerPool::from_config(config.server_pool.clone()));
        Self::with_server_pool(config, pool)
    }

    /// Build every component around an existing server pool.
    pub fn with_server_pool(
        config: RetrievalConfig,
        server_pool: Arc<ServerPool>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let registry = Arc::new(PeerRegistry::new(config.distributor.clone()));
        let distributor = RequestDistributor::new(Arc::clone(&registry));
        let retriever = RetrieveManager::new(
            config.retrieve.clone(),
            distributor.clone(),
            Arc::clone(&server_pool),
        );
        let odr = LightOdr::new(retriever.clone());
        let relay = Arc::new(TxRelay::new(distributor, config.relay.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            registry,
            server_pool,
            retriever,
            odr,
            relay,
            shutdown,
            flush_task: Mutex::new(None),
            sync_watcher: Mutex::new(None),
        })
    }

    /// Load the server pool and start its periodic flush.
    pub fn start(&self) -> Result<(), ServerPoolError> {
        self.server_pool.load()?;
        let handle = self.server_pool.spawn_flush_loop(self.shutdown.subscribe());
        if let Some(previous) = self.flush_task.lock().replace(handle) {
            previous.abort();
        }
        info!(servers = self.server_pool.len(), "[light] Backend started");
        Ok(())
    }

    /// Cancel outstanding retrievals, stop the flush task and persist the pool.
    pub async fn stop(&self) -> Result<(), ServerPoolError> {
        let canceled = self.odr.stop();
        self.shutdown.send_replace(true);

        if let Some(watcher) = self.sync_watcher.lock().take() {
            watcher.abort();
        }

        let handle = self.flush_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "[light] Server pool flush task ended abnormally");
            }
        }
        self.server_pool.flush()?;
        info!(canceled, "[light] Backend stopped");
        Ok(())
    }

    /// Put `producer` behind a sync gate watching `sync_events`.
    ///
    /// The watcher runs until the first sync finishes or `stop` is called.
    /// Gating a second producer replaces the previous watcher.
    pub fn gate_producer(
        &self,
        producer: Arc<dyn BlockProducer>,
        sync_events: broadcast::Receiver<SyncEvent>,
    ) -> Arc<ProducerGate> {
        let gate = ProducerGate::new(producer);
        let handle = gate.spawn_sync_watcher(sync_events);
        if let Some(previous) = self.sync_watcher.lock().replace(handle) {
            previous.abort();
        }
        info!("[light] Block producer gated on sync events");
        gate
    }

    /// A handshake with a server completed.
    pub fn register_peer(&self, conn: Arc<dyn PeerConnection>) -> Result<(), RegistryError> {
        let address = conn.info().address.clone();
        self.registry.add(conn)?;
        self.server_pool.note_dial_result(&address, true, None);
        Ok(())
    }

    /// A server connection closed.
    pub fn unregister_peer(&self, id: &NodeId) -> Result<PeerInfo, RegistryError> {
        self.registry.remove(id)
    }

    /// A response arrived from `peer` for wire request `request_id`.
    ///
    /// Returns `false` if the response was stale and dropped.
    pub fn deliver(&self, peer: &NodeId, request_id: SlotId, payload: Vec<u8>) -> bool {
        self.registry.deliver(peer, request_id, payload)
    }

    /// A dial attempt finished.
    pub fn note_dial_result(
        &self,
        address: &ServerAddr,
        success: bool,
        latency: Option<Duration>,
    ) {
        self.server_pool.note_dial_result(address, success, latency);
    }

    /// Servers the connection manager should dial next.
    pub fn dial_candidates(&self, count: usize) -> Vec<ServerAddr> {
        self.server_pool.next_dial_candidates(count)
    }

    /// Peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Server pool.
    pub fn server_pool(&self) -> &Arc<ServerPool> {
        &self.server_pool
    }

    /// Retrieve manager.
    pub fn retriever(&self) -> &RetrieveManager {
        &self.retriever
    }

    /// On-demand retrieval layer.
    pub fn odr(&self) -> &LightOdr {
        &self.odr
    }

    /// Transaction relay.
    pub fn relay(&self) -> &Arc<TxRelay> {
        &self.relay
    }
}
