//! Pending request state and the caller-side waiter handle.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use super::Inner;
use crate::domain::{AttemptRecord, NodeId, RequestKey, RetrieveError, SlotId};

/// Terminal result delivered to every waiter.
pub type Outcome = Result<Vec<u8>, RetrieveError>;

/// Lifecycle of one logical retrieval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No active slot; dispatch pending or waiting for a peer.
    Pending,
    /// One slot dispatched, awaiting response or timeout.
    InFlight,
    /// A response passed validation.
    Validated,
    /// The last attempt failed; the next one will avoid that peer.
    Retry,
    /// Deadline or attempt budget exhausted.
    Failed,
    /// Every waiter left, or the manager stopped.
    Canceled,
}

impl Phase {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Validated | Phase::Failed | Phase::Canceled)
    }
}

struct PendingState {
    phase: Phase,
    waiters: HashMap<u64, oneshot::Sender<Outcome>>,
    next_waiter: u64,
    attempts: u32,
    excluded: HashSet<NodeId>,
    recent: HashMap<NodeId, Instant>,
    history: Vec<AttemptRecord>,
    active_slot: Option<SlotId>,
}

/// One logical retrieval shared by every caller asking for the same key.
pub(crate) struct PendingRequest {
    pub(crate) key: RequestKey,
    pub(crate) created: Instant,
    state: Mutex<PendingState>,
    cancel: watch::Sender<bool>,
}

impl PendingRequest {
    pub(crate) fn new(key: RequestKey) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            key,
            created: Instant::now(),
            state: Mutex::new(PendingState {
                phase: Phase::Pending,
                waiters: HashMap::new(),
                next_waiter: 0,
                attempts: 0,
                excluded: HashSet::new(),
                recent: HashMap::new(),
                history: Vec::new(),
                active_slot: None,
            }),
            cancel,
        })
    }

    /// Add a waiter unless the request already reached a terminal phase.
    pub(crate) fn add_waiter(&self) -> Option<(u64, oneshot::Receiver<Outcome>)> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return None;
        }
        let id = state.next_waiter;
        state.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Some((id, rx))
    }

    /// Remove one waiter. Returns `true` if it was the last one and the
    /// request is now canceled.
    pub(crate) fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        if state.waiters.remove(&id).is_none() || state.phase.is_terminal() {
            return false;
        }
        if !state.waiters.is_empty() {
            return false;
        }
        state.phase = Phase::Canceled;
        drop(state);
        self.cancel.send_replace(true);
        true
    }

    /// Deliver `outcome` to every waiter exactly once. Returns the number of
    /// waiters served, or `None` if the request was already terminal.
    pub(crate) fn resolve(&self, outcome: Outcome) -> Option<usize> {
        let waiters = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return None;
            }
            state.phase = match &outcome {
                Ok(_) => Phase::Validated,
                Err(RetrieveError::Canceled) | Err(RetrieveError::Stopped) => Phase::Canceled,
                Err(_) => Phase::Failed,
            };
            std::mem::take(&mut state.waiters)
        };
        let served = waiters.len();
        for (_, tx) in waiters {
            let _ = tx.send(outcome.clone());
        }
        self.cancel.send_replace(true);
        Some(served)
    }

    pub(crate) fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock();
        if !state.phase.is_terminal() {
            state.phase = phase;
        }
    }

    /// Mark a slot active on `peer`. Returns the attempt number.
    pub(crate) fn begin_attempt(&self, slot: SlotId, peer: NodeId) -> u32 {
        let mut state = self.state.lock();
        debug_assert!(state.active_slot.is_none(), "two active slots for one key");
        state.active_slot = Some(slot);
        state.attempts += 1;
        state.recent.insert(peer, Instant::now());
        if !state.phase.is_terminal() {
            state.phase = Phase::InFlight;
        }
        state.attempts
    }

    /// Record an attempt outcome. A failed attempt excludes its peer.
    pub(crate) fn end_attempt(&self, record: AttemptRecord, failed: bool) {
        let mut state = self.state.lock();
        state.active_slot = None;
        if failed {
            state.excluded.insert(record.peer);
            if !state.phase.is_terminal() {
                state.phase = Phase::Retry;
            }
        }
        state.history.push(record);
    }

    /// Excluded peers and per-peer last use, copied for one dispatch.
    pub(crate) fn dispatch_view(&self) -> (HashSet<NodeId>, HashMap<NodeId, Instant>) {
        let state = self.state.lock();
        (state.excluded.clone(), state.recent.clone())
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.state.lock().attempts
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub(crate) fn history(&self) -> Vec<AttemptRecord> {
        self.state.lock().history.clone()
    }

    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub(crate) fn active_slot(&self) -> Option<SlotId> {
        self.state.lock().active_slot
    }
}

/// A caller's handle on a pending retrieval.
///
/// Resolves to the shared terminal outcome. Dropping it (or calling
/// [`Waiter::cancel`]) removes only this caller; the retrieval itself stops
/// once its last waiter is gone.
pub struct Waiter {
    request: Arc<PendingRequest>,
    manager: Weak<Inner>,
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    done: bool,
}

impl Waiter {
    pub(crate) fn new(
        request: Arc<PendingRequest>,
        manager: Weak<Inner>,
        id: u64,
        rx: oneshot::Receiver<Outcome>,
    ) -> Self {
        Self {
            request,
            manager,
            id,
            rx,
            done: false,
        }
    }

    /// Key of the retrieval this waiter belongs to.
    pub fn key(&self) -> RequestKey {
        self.request.key
    }

    /// Stop waiting.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Future for Waiter {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                Poll::Ready(result.unwrap_or(Err(RetrieveError::Canceled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.request.remove_waiter(self.id) {
            if let Some(inner) = self.manager.upgrade() {
                inner.on_abandoned(&self.request);
            }
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("key", &self.request.key)
            .field("id", &self.id)
            .finish()
    }
}
