//! # Producer Sync Gate
//!
//! Keeps the local block producer quiet while the chain is syncing.
//!
//! A one-shot watcher subscribes to sync events:
//!
//! - `Started`: starting is forbidden; a running producer is stopped and
//!   remembered as wanting to run.
//! - `Done` / `Failed`: starting is allowed again, the producer restarts if
//!   it wanted to run, the watcher unsubscribes and exits.
//!
//! Events after the first `Done`/`Failed` are not observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ports::BlockProducer;

/// Chain sync lifecycle events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// A sync run began.
    Started,
    /// The sync run completed.
    Done,
    /// The sync run gave up.
    Failed,
}

/// Why the sync watcher exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchExit {
    /// The first sync run finished with this event.
    SyncFinished(SyncEvent),
    /// The event source went away before a sync finished.
    ChannelClosed,
}

/// Start/stop gate in front of a [`BlockProducer`].
pub struct ProducerGate {
    producer: Arc<dyn BlockProducer>,
    can_start: AtomicBool,
    should_start: AtomicBool,
}

impl ProducerGate {
    /// Create a gate that allows starting until a sync begins.
    pub fn new(producer: Arc<dyn BlockProducer>) -> Arc<Self> {
        Arc::new(Self {
            producer,
            can_start: AtomicBool::new(true),
            should_start: AtomicBool::new(false),
        })
    }

    /// Start producing, or record the intent if a sync is running.
    pub fn start(&self) {
        self.should_start.store(true, Ordering::SeqCst);
        if !self.can_start.load(Ordering::SeqCst) {
            info!("[light] Sync in progress, block production deferred");
            return;
        }
        self.producer.start();
    }

    /// Stop producing and drop any pending start intent.
    pub fn stop(&self) {
        self.producer.stop();
        self.should_start.store(false, Ordering::SeqCst);
    }

    /// Whether starting is currently allowed.
    pub fn can_start(&self) -> bool {
        self.can_start.load(Ordering::SeqCst)
    }

    /// Whether a start is pending until sync finishes.
    pub fn start_pending(&self) -> bool {
        !self.can_start() && self.should_start.load(Ordering::SeqCst)
    }

    /// Apply one sync event. Returns `true` once the sync run finished.
    pub fn on_sync_event(&self, event: SyncEvent) -> bool {
        match event {
            SyncEvent::Started => {
                self.can_start.store(false, Ordering::SeqCst);
                if self.producer.is_producing() {
                    self.stop();
                    self.should_start.store(true, Ordering::SeqCst);
                    info!("[light] Sync started, block production paused");
                }
                false
            }
            SyncEvent::Done | SyncEvent::Failed => {
                let resume = self.should_start.swap(false, Ordering::SeqCst);
                self.can_start.store(true, Ordering::SeqCst);
                if resume {
                    info!(?event, "[light] Sync finished, resuming block production");
                    self.start();
                }
                true
            }
        }
    }

    /// Watch `events` until the first sync run finishes, then unsubscribe.
    pub fn spawn_sync_watcher(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SyncEvent>,
    ) -> JoinHandle<WatchExit> {
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let exit = loop {
                match events.recv().await {
                    Ok(event) => {
                        debug!(?event, "[light] Sync event");
                        if gate.on_sync_event(event) {
                            break WatchExit::SyncFinished(event);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "[light] Sync watcher lagged");
                    }
                    Err(RecvError::Closed) => break WatchExit::ChannelClosed,
                }
            };
            drop(events);
            debug!(?exit, "[light] Sync watcher unsubscribed");
            exit
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProducer;

    fn gate() -> (Arc<ProducerGate>, Arc<MockProducer>) {
        let producer = Arc::new(MockProducer::default());
        (ProducerGate::new(producer.clone()), producer)
    }

    #[test]
    fn test_start_when_not_syncing() {
        let (gate, producer) = gate();
        gate.start();
        assert!(producer.is_producing());
    }

    #[test]
    fn test_sync_pauses_and_done_resumes() {
        let (gate, producer) = gate();
        gate.start();

        assert!(!gate.on_sync_event(SyncEvent::Started));
        assert!(!producer.is_producing());
        assert!(gate.start_pending());

        assert!(gate.on_sync_event(SyncEvent::Done));
        assert!(producer.is_producing());
        assert_eq!(producer.starts(), 2);
    }

    #[test]
    fn test_start_during_sync_only_records_intent() {
        let (gate, producer) = gate();
        gate.on_sync_event(SyncEvent::Started);
        gate.start();
        assert!(!producer.is_producing());

        gate.on_sync_event(SyncEvent::Failed);
        assert!(producer.is_producing());
    }

    #[test]
    fn test_idle_producer_stays_idle_after_sync() {
        let (gate, producer) = gate();
        gate.on_sync_event(SyncEvent::Started);
        gate.on_sync_event(SyncEvent::Done);
        assert!(!producer.is_producing());
        assert!(gate.can_start());
    }

    #[test]
    fn test_stop_during_sync_cancels_intent() {
        let (gate, producer) = gate();
        gate.start();
        gate.on_sync_event(SyncEvent::Started);
        gate.stop();
        gate.on_sync_event(SyncEvent::Done);
        assert!(!producer.is_producing());
    }

    #[tokio::test]
    async fn test_watcher_exits_and_unsubscribes_after_first_finish() {
        let (gate, producer) = gate();
        gate.start();
        let (tx, rx) = broadcast::channel(8);
        let handle = gate.spawn_sync_watcher(rx);

        tx.send(SyncEvent::Started).unwrap();
        tx.send(SyncEvent::Done).unwrap();
        assert_eq!(handle.await.unwrap(), WatchExit::SyncFinished(SyncEvent::Done));

        assert_eq!(tx.receiver_count(), 0);
        assert!(tx.send(SyncEvent::Started).is_err());
        assert!(producer.is_producing());
    }

    #[tokio::test]
    async fn test_watcher_reports_closed_channel() {
        let (gate, _) = gate();
        let (tx, rx) = broadcast::channel(8);
        let handle = gate.spawn_sync_watcher(rx);
        tx.send(SyncEvent::Started).unwrap();
        drop(tx);
        assert_eq!(handle.await.unwrap(), WatchExit::ChannelClosed);
        assert!(!gate.can_start());
    }
}
