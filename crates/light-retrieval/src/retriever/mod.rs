//! # Retrieve Manager
//!
//! Orchestrates one logical retrieval end to end: dispatch through the
//! distributor, per-attempt timeout, validation, retry on a different peer
//! and fan-out of the terminal outcome to every waiting caller.
//!
//! ## State Machine
//!
//! ```text
//! Pending ──dispatch──▶ InFlight ──valid──▶ Validated
//!    ▲                     │
//!    │                     ├─invalid/timeout/peer gone──▶ Retry ──▶ Pending
//!    │                     │
//!    └──no peer: wait on registry change
//!
//! deadline or attempt budget ──▶ Failed (Exhausted)
//! last waiter leaves / stop  ──▶ Canceled
//! ```
//!
//! ## Guarantees
//!
//! - Attempts for one key are strictly sequential: at most one active slot.
//! - Concurrent callers with the same key share one pending request and
//!   receive the same outcome.
//! - Transient conditions never reach callers; only terminal outcomes do.
//! - Cancellation and malformed requests never penalize a peer.
//!
//! ## Lock Order
//!
//! `join` takes the pending map and then a request's own lock. Resolution
//! and waiter removal take the request lock, release it, and only then touch
//! the map. The registry lock is never held together with either.

mod pending;

#[cfg(test)]
mod tests;

pub use pending::{Outcome, Phase, Waiter};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::RetrieveConfig;
use crate::distributor::{DispatchRequest, DistributionSlot, RequestDistributor};
use crate::domain::{
    AttemptRecord, PeerFilter, RequestKey, RetrieveError, SlotEvent, SlotOutcome, TransportError,
};
use crate::ports::ResponseValidator;
use crate::server_pool::ServerPool;
use pending::PendingRequest;

/// One logical data need.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrieveRequest {
    /// Deduplication key.
    pub key: RequestKey,
    /// Wire payload sent to peers.
    pub payload: Vec<u8>,
    /// Peers allowed to serve it.
    pub filter: PeerFilter,
}

impl RetrieveRequest {
    /// Request served by any light-serving peer.
    pub fn new(key: RequestKey, payload: Vec<u8>) -> Self {
        Self {
            key,
            payload,
            filter: PeerFilter::light_serving(),
        }
    }

    /// Restrict the peers allowed to serve this request.
    pub fn with_filter(mut self, filter: PeerFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Counters for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetrieveStats {
    /// Logical retrievals currently pending.
    pub pending: usize,
    /// Retrievals resolved with a valid response.
    pub validated: u64,
    /// Retrievals that ran out of deadline or attempts.
    pub exhausted: u64,
    /// Retrievals canceled by their callers or by `stop`.
    pub canceled: u64,
    /// Dispatch attempts across all retrievals.
    pub attempts: u64,
    /// Callers that joined an existing retrieval.
    pub deduplicated: u64,
}

#[derive(Default)]
struct Counters {
    validated: AtomicU64,
    exhausted: AtomicU64,
    canceled: AtomicU64,
    attempts: AtomicU64,
    deduplicated: AtomicU64,
}

pub(crate) struct Inner {
    config: RetrieveConfig,
    distributor: RequestDistributor,
    server_pool: Arc<ServerPool>,
    pending: Mutex<HashMap<RequestKey, Arc<PendingRequest>>>,
    stopped: AtomicBool,
    counters: Counters,
}

impl Inner {
    /// Drop `request` from the map if it is still the entry for its key.
    fn forget(&self, request: &Arc<PendingRequest>) {
        let mut pending = self.pending.lock();
        if let Some(current) = pending.get(&request.key) {
            if Arc::ptr_eq(current, request) {
                pending.remove(&request.key);
            }
        }
        light_telemetry::metrics::set_pending_requests(pending.len());
    }

    /// The last waiter left.
    pub(crate) fn on_abandoned(&self, request: &Arc<PendingRequest>) {
        self.counters.canceled.fetch_add(1, Ordering::Relaxed);
        light_telemetry::metrics::record_retrieval(
            RetrieveError::Canceled.label(),
            request.created.elapsed().as_secs_f64(),
        );
        debug!(key = %request.key, attempts = request.attempts(), "[light] Retrieval canceled by last waiter");
        self.forget(request);
    }

    fn complete(&self, request: &Arc<PendingRequest>, outcome: Outcome) {
        let label = match &outcome {
            Ok(_) => "validated",
            Err(e) => e.label(),
        };
        let is_ok = outcome.is_ok();
        let exhausted = matches!(outcome, Err(RetrieveError::Exhausted { .. }));

        if let Some(waiters) = request.resolve(outcome) {
            let elapsed = request.created.elapsed();
            light_telemetry::metrics::record_retrieval(label, elapsed.as_secs_f64());
            let history = request.history();
            if is_ok {
                self.counters.validated.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %request.key,
                    waiters,
                    attempts = history.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "[light] Retrieval validated"
                );
            } else if exhausted {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %request.key,
                    waiters,
                    attempts = history.len(),
                    history = ?history.iter().map(|a| (a.peer.to_string(), a.outcome.label())).collect::<Vec<_>>(),
                    "[light] Retrieval exhausted"
                );
            } else {
                self.counters.canceled.fetch_add(1, Ordering::Relaxed);
                debug!(key = %request.key, waiters, outcome = label, "[light] Retrieval ended");
            }
        }
        self.forget(request);
    }
}

/// Deduplicating, retrying retrieval orchestrator.
#[derive(Clone)]
pub struct RetrieveManager {
    inner: Arc<Inner>,
}

impl RetrieveManager {
    /// Create a manager dispatching through `distributor` and reporting peer
    /// outcomes to `server_pool`.
    pub fn new(
        config: RetrieveConfig,
        distributor: RequestDistributor,
        server_pool: Arc<ServerPool>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                distributor,
                server_pool,
                pending: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    /// Retrieve `request`, waiting until a terminal outcome.
    pub async fn retrieve(
        &self,
        request: RetrieveRequest,
        validator: Arc<dyn ResponseValidator>,
    ) -> Outcome {
        self.join(request, validator)?.await
    }

    /// Join the pending retrieval for `request.key`, starting one if none is
    /// in progress.
    ///
    /// A caller joining an existing retrieval shares its validator. Must be
    /// called within a Tokio runtime.
    pub fn join(
        &self,
        request: RetrieveRequest,
        validator: Arc<dyn ResponseValidator>,
    ) -> Result<Waiter, RetrieveError> {
        if request.payload.is_empty() {
            return Err(RetrieveError::MalformedRequest("empty payload".to_string()));
        }

        let mut pending = self.inner.pending.lock();
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(RetrieveError::Stopped);
        }

        if let Some(existing) = pending.get(&request.key) {
            if let Some((id, rx)) = existing.add_waiter() {
                self.inner.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(key = %request.key, "[light] Joined pending retrieval");
                return Ok(Waiter::new(
                    Arc::clone(existing),
                    Arc::downgrade(&self.inner),
                    id,
                    rx,
                ));
            }
        }

        let fresh = PendingRequest::new(request.key);
        let (id, rx) = fresh
            .add_waiter()
            .ok_or(RetrieveError::Canceled)?;
        pending.insert(request.key, Arc::clone(&fresh));
        light_telemetry::metrics::set_pending_requests(pending.len());
        drop(pending);

        debug!(key = %request.key, "[light] Retrieval started");
        let waiter = Waiter::new(Arc::clone(&fresh), Arc::downgrade(&self.inner), id, rx);
        tokio::spawn(drive(Arc::clone(&self.inner), fresh, request, validator));
        Ok(waiter)
    }

    /// Cancel every pending retrieval and refuse new ones.
    ///
    /// Returns the number of retrievals canceled.
    pub fn stop(&self) -> usize {
        self.inner.stopped.store(true, Ordering::Release);
        let drained: Vec<Arc<PendingRequest>> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, request)| request).collect()
        };
        for request in &drained {
            self.inner.complete(request, Err(RetrieveError::Canceled));
        }
        info!(canceled = drained.len(), "[light] Retrieve manager stopped");
        drained.len()
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Number of pending retrievals.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Phase of the pending retrieval for `key`.
    pub fn phase(&self, key: &RequestKey) -> Option<Phase> {
        self.pending(key).map(|request| request.phase())
    }

    /// Attempts made so far by the pending retrieval for `key`.
    pub fn history(&self, key: &RequestKey) -> Option<Vec<AttemptRecord>> {
        self.pending(key).map(|request| request.history())
    }

    /// Callers waiting on the pending retrieval for `key`.
    pub fn waiter_count(&self, key: &RequestKey) -> usize {
        self.pending(key).map(|request| request.waiter_count()).unwrap_or(0)
    }

    /// Whether the pending retrieval for `key` has a slot in flight.
    pub fn has_active_slot(&self, key: &RequestKey) -> bool {
        self.pending(key)
            .map(|request| request.active_slot().is_some())
            .unwrap_or(false)
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> RetrieveStats {
        let c = &self.inner.counters;
        RetrieveStats {
            pending: self.pending_count(),
            validated: c.validated.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            canceled: c.canceled.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            deduplicated: c.deduplicated.load(Ordering::Relaxed),
        }
    }

    fn pending(&self, key: &RequestKey) -> Option<Arc<PendingRequest>> {
        self.inner.pending.lock().get(key).cloned()
    }
}

enum Wake {
    Event(SlotEvent),
    SendFailed(TransportError),
    TimedOut,
    Canceled,
}

/// Send on `slot`, then wait for its response or peer-gone notice.
async fn run_attempt(slot: &mut DistributionSlot, payload: &[u8]) -> Wake {
    if let Err(e) = slot.send(payload).await {
        return Wake::SendFailed(e);
    }
    Wake::Event(slot.wait().await)
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|canceled| *canceled).await;
}

/// Drive one pending request until it resolves or is canceled.
async fn drive(
    inner: Arc<Inner>,
    request: Arc<PendingRequest>,
    job: RetrieveRequest,
    validator: Arc<dyn ResponseValidator>,
) {
    let config = &inner.config;
    let registry = Arc::clone(inner.distributor.registry());
    let deadline = request.created + config.request_deadline();
    let mut cancel = request.cancel_signal();
    let mut changes = registry.subscribe();

    let outcome: Outcome = loop {
        if *cancel.borrow() {
            return;
        }
        request.set_phase(Phase::Pending);
        let now = Instant::now();
        let attempts = request.attempts();
        if now >= deadline || attempts >= config.max_attempts {
            break Err(RetrieveError::Exhausted { attempts });
        }
        let remaining = deadline - now;

        let (excluded, recent) = request.dispatch_view();
        changes.borrow_and_update();
        let reserved = inner.distributor.reserve(&DispatchRequest {
            key: job.key,
            payload: &job.payload,
            filter: &job.filter,
            excluded: &excluded,
            recent: &recent,
        });

        let mut slot = match reserved {
            Ok(slot) => slot,
            Err(e) => {
                debug!(
                    key = %job.key,
                    excluded = excluded.len(),
                    reason = %e,
                    "[light] No peer available, waiting for registry change"
                );
                let wait = config.registry_wait_slice().min(remaining);
                tokio::select! {
                    _ = changes.changed() => {}
                    _ = sleep(wait) => {}
                    _ = cancel_requested(&mut cancel) => return,
                }
                continue;
            }
        };

        inner.counters.attempts.fetch_add(1, Ordering::Relaxed);
        let attempt = request.begin_attempt(slot.id(), slot.peer().id);
        let timeout = config.attempt_timeout(slot.expected_rtt(), remaining);
        debug!(
            key = %job.key,
            peer = %slot.peer().id,
            attempt,
            timeout_ms = timeout.as_millis() as u64,
            "[light] Attempt in flight"
        );

        // The timer covers the send as well as the response.
        let wake = tokio::select! {
            wake = run_attempt(&mut slot, &job.payload) => wake,
            _ = sleep(timeout) => Wake::TimedOut,
            _ = cancel_requested(&mut cancel) => Wake::Canceled,
        };

        let peer = slot.peer().clone();
        let (slot_outcome, response) = match wake {
            Wake::Canceled => {
                let elapsed = slot.finish(SlotOutcome::Abandoned);
                request.end_attempt(
                    AttemptRecord {
                        peer: peer.id,
                        outcome: SlotOutcome::Abandoned,
                        elapsed,
                    },
                    false,
                );
                return;
            }
            Wake::Event(SlotEvent::Response(bytes)) => match validator.validate(&bytes) {
                Ok(()) => (SlotOutcome::DeliveredValid, Some(bytes)),
                Err(reason) => {
                    warn!(key = %job.key, peer = %peer.id, reason = %reason, "[light] Invalid response");
                    (SlotOutcome::DeliveredInvalid, None)
                }
            },
            Wake::Event(SlotEvent::PeerGone) => (SlotOutcome::PeerDisconnected, None),
            Wake::SendFailed(e) => {
                debug!(key = %job.key, peer = %peer.id, reason = %e, "[light] Send failed, rotating peer");
                (SlotOutcome::SendFailed, None)
            }
            Wake::TimedOut => (SlotOutcome::TimedOut, None),
        };

        let elapsed = slot.finish(slot_outcome);
        light_telemetry::metrics::record_attempt(slot_outcome.label());
        request.end_attempt(
            AttemptRecord {
                peer: peer.id,
                outcome: slot_outcome,
                elapsed,
            },
            response.is_none(),
        );

        match response {
            Some(bytes) => {
                registry.observe_latency(&peer.id, elapsed);
                inner
                    .server_pool
                    .note_request_result(&peer.address, true, Some(elapsed));
                break Ok(bytes);
            }
            None => {
                inner.server_pool.note_request_result(&peer.address, false, None);
                debug!(
                    key = %job.key,
                    peer = %peer.id,
                    outcome = slot_outcome.label(),
                    attempt,
                    "[light] Attempt failed, retrying elsewhere"
                );
            }
        }
    };

    inner.complete(&request, outcome);
}
