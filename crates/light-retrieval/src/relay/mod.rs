//! # Transaction Relay
//!
//! Best-effort fan-out of locally created transactions to a bounded number
//! of distinct peers. No retry and no validation: each chosen peer gets the
//! batch once and its slot is released right after the send. A send that
//! does not finish within `send_timeout` counts as failed.
//!
//! A small LRU remembers which peers already received each transaction, so
//! re-relaying prefers peers that have not seen the batch. When too few
//! fresh peers are available, peers that saw it are used to fill the fan-out.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::distributor::{DispatchRequest, RequestDistributor};
use crate::domain::{Hash, NodeId, PeerFilter, RequestKey, SlotOutcome, Transaction};
use crate::ports::TxRelayApi;

/// Result of one relay call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Transactions in the batch.
    pub transactions: usize,
    /// Peers the batch was handed to.
    pub sent_to: Vec<NodeId>,
    /// Sends the transport refused or that timed out.
    pub failed: usize,
}

/// Fire-and-forget transaction broadcaster.
pub struct TxRelay {
    distributor: RequestDistributor,
    config: RelayConfig,
    seen: Mutex<LruCache<Hash, HashSet<NodeId>>>,
}

impl TxRelay {
    /// Create a relay over `distributor`.
    pub fn new(distributor: RequestDistributor, config: RelayConfig) -> Self {
        let capacity = NonZeroUsize::new(config.seen_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            distributor,
            config,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Send `transactions` once each to up to `fanout` distinct peers.
    pub async fn relay(&self, transactions: &[Transaction]) -> RelayReport {
        let mut report = RelayReport {
            transactions: transactions.len(),
            ..RelayReport::default()
        };
        if transactions.is_empty() || self.config.fanout == 0 {
            return report;
        }

        let payload = match bincode::serialize(transactions) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "[light] Could not encode relay batch");
                return report;
            }
        };
        let key = RequestKey::derive("relay", &payload);
        let filter = PeerFilter::light_serving();
        let recent = HashMap::new();

        // Peers that already received every transaction in the batch.
        let saturated = self.saturated_peers(transactions);
        let mut tried: HashSet<NodeId> = HashSet::new();

        for allow_saturated in [false, true] {
            while report.sent_to.len() < self.config.fanout {
                let mut excluded = tried.clone();
                if !allow_saturated {
                    excluded.extend(saturated.iter().copied());
                }
                let reserved = self.distributor.reserve(&DispatchRequest {
                    key,
                    payload: &payload,
                    filter: &filter,
                    excluded: &excluded,
                    recent: &recent,
                });
                let Ok(mut slot) = reserved else {
                    break;
                };
                let peer = slot.peer().id;
                tried.insert(peer);

                match timeout(self.config.send_timeout(), slot.send(&payload)).await {
                    Ok(Ok(())) => {
                        slot.finish(SlotOutcome::Relayed);
                        report.sent_to.push(peer);
                        light_telemetry::metrics::record_relay_send("sent");
                    }
                    Ok(Err(e)) => {
                        debug!(peer = %peer, reason = %e, "[light] Relay send failed");
                        slot.finish(SlotOutcome::SendFailed);
                        report.failed += 1;
                        light_telemetry::metrics::record_relay_send("failed");
                    }
                    Err(_) => {
                        debug!(peer = %peer, "[light] Relay send timed out");
                        slot.finish(SlotOutcome::TimedOut);
                        report.failed += 1;
                        light_telemetry::metrics::record_relay_send("timeout");
                    }
                }
            }
        }

        self.remember(transactions, &report.sent_to);
        debug!(
            transactions = report.transactions,
            peers = report.sent_to.len(),
            failed = report.failed,
            "[light] Relayed transactions"
        );
        report
    }

    /// Peers recorded as having received `hash`.
    pub fn seen_by(&self, hash: &Hash) -> HashSet<NodeId> {
        self.seen.lock().peek(hash).cloned().unwrap_or_default()
    }

    fn saturated_peers(&self, transactions: &[Transaction]) -> HashSet<NodeId> {
        let mut seen = self.seen.lock();
        let mut sets = transactions
            .iter()
            .map(|tx| seen.get(&tx.hash).cloned().unwrap_or_default());
        let first = sets.next().unwrap_or_default();
        sets.fold(first, |acc, set| acc.intersection(&set).copied().collect())
    }

    fn remember(&self, transactions: &[Transaction], peers: &[NodeId]) {
        if peers.is_empty() {
            return;
        }
        let mut seen = self.seen.lock();
        for tx in transactions {
            let entry = seen.get_or_insert_mut(tx.hash, HashSet::new);
            entry.extend(peers.iter().copied());
        }
    }
}

#[async_trait]
impl TxRelayApi for TxRelay {
    async fn relay(&self, transactions: &[Transaction]) -> RelayReport {
        TxRelay::relay(self, transactions).await
    }
}
