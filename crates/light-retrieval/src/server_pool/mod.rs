//! # Server Pool
//!
//! Persistent, scored directory of candidate server addresses. The pool
//! decides whom the connection manager should dial next; it never opens
//! connections itself.
//!
//! ## Scoring
//!
//! - Latency is an exponentially weighted moving average of observed dials
//!   and requests.
//! - Each failure extends a consecutive-failure streak; any success clears it.
//! - At `failure_threshold` consecutive failures a record cools down for
//!   `base_cooldown`, doubling with each further failure up to `max_cooldown`.
//! - Records last seen before the staleness threshold load as unknown but
//!   eligible.
//!
//! Records are never deleted. Demoted records sink to the bottom of the
//! candidate order.

mod store;


pub use store::{JsonFileStore, MemoryStore};

use parking_lot::RwLock;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerPoolConfig;
use crate::domain::{cooldown_window, ServerAddr, ServerPoolError, ServerRecord};
use crate::ports::{Clock, ServerPoolStore, SystemClock};

/// Scored directory of candidate servers.
pub struct ServerPool {
    config: ServerPoolConfig,
    records: RwLock<BTreeMap<ServerAddr, ServerRecord>>,
    store: Arc<dyn ServerPoolStore>,
    clock: Arc<dyn Clock>,
    dirty: AtomicBool,
}

impl ServerPool {
    /// Create an empty pool over `store`.
    pub fn new(
        config: ServerPoolConfig,
        store: Arc<dyn ServerPoolStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            records: RwLock::new(BTreeMap::new()),
            store,
            clock,
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a pool persisting to `config.store_path`, or to memory if unset.
    pub fn from_config(config: ServerPoolConfig) -> Self {
        let store: Arc<dyn ServerPoolStore> = match &config.store_path {
            Some(path) => Arc::new(JsonFileStore::new(path.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, store, Arc::new(SystemClock))
    }

    /// Load persisted records, marking old ones stale.
    ///
    /// Records already known in memory (seeds) are kept unless the store has
    /// an entry for the same address. Returns the number of records loaded.
    pub fn load(&self) -> Result<usize, ServerPoolError> {
        let loaded = self.store.load()?;
        let now = self.clock.now_unix_ms();
        let mut stale = 0usize;
        let count = loaded.len();

        let mut records = self.records.write();
        for (addr, mut record) in loaded {
            if now.saturating_sub(record.last_seen_ms) > self.config.stale_after_ms {
                record.stale = true;
                stale += 1;
            }
            records.insert(addr, record);
        }
        drop(records);

        info!(loaded = count, stale, "[light] Server pool loaded");
        Ok(count)
    }

    /// Persist every record.
    pub fn flush(&self) -> Result<(), ServerPoolError> {
        let snapshot = self.records.read().clone();
        self.store.save(&snapshot)?;
        self.dirty.store(false, Ordering::Release);
        debug!(records = snapshot.len(), "[light] Server pool flushed");
        Ok(())
    }

    /// Learn a server address. Returns `true` if it was new.
    pub fn add_server(&self, addr: ServerAddr) -> bool {
        let mut records = self.records.write();
        if records.contains_key(&addr) {
            return false;
        }
        debug!(address = %addr, "[light] Server learned");
        records.insert(addr, ServerRecord::default());
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Record the outcome of a dial attempt.
    pub fn note_dial_result(&self, addr: &ServerAddr, success: bool, latency: Option<Duration>) {
        self.observe(addr, success, latency, "dial");
    }

    /// Record the outcome of a request served (or not) by this server.
    pub fn note_request_result(&self, addr: &ServerAddr, success: bool, latency: Option<Duration>) {
        self.observe(addr, success, latency, "request");
    }

    fn observe(&self, addr: &ServerAddr, success: bool, latency: Option<Duration>, source: &str) {
        let now = self.clock.now_unix_ms();
        let mut records = self.records.write();
        let record = records.entry(addr.clone()).or_default();
        if success {
            record.note_success(latency, self.config.latency_ewma_alpha, now);
        } else {
            let streak = record.note_failure(now);
            light_telemetry::metrics::record_server_demotion();
            if streak >= self.config.failure_threshold {
                warn!(
                    address = %addr,
                    streak,
                    source,
                    cooldown_ms = self.cooldown_of(record).map(|d| d.as_millis() as u64).unwrap_or(0),
                    "[light] Server cooling down"
                );
            } else {
                debug!(address = %addr, streak, source, "[light] Server demoted");
            }
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Up to `count` addresses not cooling down, best score first.
    pub fn next_dial_candidates(&self, count: usize) -> Vec<ServerAddr> {
        let now = self.clock.now_unix_ms();
        let unknown = self.config.unknown_latency_ms as f64;
        let records = self.records.read();

        let mut eligible: Vec<(&ServerAddr, &ServerRecord)> = records
            .iter()
            .filter(|(_, record)| !self.cooling_at(record, now))
            .collect();
        eligible.sort_by(|(addr_a, a), (addr_b, b)| {
            a.ranking_streak()
                .cmp(&b.ranking_streak())
                .then_with(|| {
                    a.ranking_latency_ms(unknown)
                        .partial_cmp(&b.ranking_latency_ms(unknown))
                        .unwrap_or(CmpOrdering::Equal)
                })
                .then_with(|| b.last_seen_ms.cmp(&a.last_seen_ms))
                .then_with(|| addr_a.cmp(addr_b))
        });
        eligible
            .into_iter()
            .take(count)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Whether `addr` is currently in cooldown.
    pub fn is_cooling_down(&self, addr: &ServerAddr) -> bool {
        let now = self.clock.now_unix_ms();
        self.records
            .read()
            .get(addr)
            .map(|record| self.cooling_at(record, now))
            .unwrap_or(false)
    }

    /// Operator reset: clear the score of `addr`. Returns `false` if unknown.
    pub fn reset(&self, addr: &ServerAddr) -> bool {
        let mut records = self.records.write();
        match records.get_mut(addr) {
            Some(record) => {
                *record = ServerRecord::default();
                self.dirty.store(true, Ordering::Release);
                info!(address = %addr, "[light] Server record reset");
                true
            }
            None => false,
        }
    }

    /// Copy of one record.
    pub fn record(&self, addr: &ServerAddr) -> Option<ServerRecord> {
        self.records.read().get(addr).cloned()
    }

    /// Copy of every record.
    pub fn records(&self) -> BTreeMap<ServerAddr, ServerRecord> {
        self.records.read().clone()
    }

    /// Number of known servers.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no server is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush every `flush_interval` while records changed, and once more on
    /// shutdown.
    pub fn spawn_flush_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.flush_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if pool.dirty.load(Ordering::Acquire) {
                            if let Err(e) = pool.flush() {
                                warn!(error = %e, "[light] Periodic server pool flush failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = pool.flush() {
                warn!(error = %e, "[light] Final server pool flush failed");
            }
            debug!("[light] Server pool flush loop stopped");
        })
    }

    fn cooldown_of(&self, record: &ServerRecord) -> Option<Duration> {
        cooldown_window(
            record.ranking_streak(),
            self.config.failure_threshold,
            self.config.base_cooldown(),
            self.config.max_cooldown(),
        )
    }

    fn cooling_at(&self, record: &ServerRecord, now_ms: u64) -> bool {
        match (self.cooldown_of(record), record.last_failure_ms) {
            (Some(window), Some(failed_at)) => {
                now_ms < failed_at.saturating_add(window.as_millis() as u64)
            }
            _ => false,
        }
    }
}
