//! Tests for the Retrieve Manager

use super::*;
use crate::config::{DistributorConfig, ServerPoolConfig};
use crate::domain::ServerAddr;
use crate::registry::PeerRegistry;
use crate::server_pool::MemoryStore;
use crate::testing::{node_id, peer_info, ManualClock, MockBehavior, MockPeer};

struct Harness {
    registry: Arc<PeerRegistry>,
    pool: Arc<ServerPool>,
    manager: RetrieveManager,
}

fn harness(config: RetrieveConfig) -> Harness {
    let registry = Arc::new(PeerRegistry::new(DistributorConfig::for_testing()));
    let pool = Arc::new(ServerPool::new(
        ServerPoolConfig::for_testing(),
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::new(1_000_000)),
    ));
    let manager = RetrieveManager::new(
        config,
        RequestDistributor::new(Arc::clone(&registry)),
        Arc::clone(&pool),
    );
    Harness {
        registry,
        pool,
        manager,
    }
}

impl Harness {
    fn add_peer(&self, byte: u8, behavior: MockBehavior) -> Arc<MockPeer> {
        let peer = MockPeer::new(peer_info(byte), &self.registry, behavior);
        self.registry.add(peer.clone()).unwrap();
        peer
    }
}

fn request(tag: &str) -> RetrieveRequest {
    RetrieveRequest::new(
        RequestKey::derive("test", tag.as_bytes()),
        tag.as_bytes().to_vec(),
    )
}

fn accept_good() -> Arc<dyn ResponseValidator> {
    Arc::new(|bytes: &[u8]| {
        if bytes == b"good" {
            Ok(())
        } else {
            Err("unexpected payload".to_string())
        }
    })
}

fn good(delay_ms: u64) -> MockBehavior {
    MockBehavior::reply_with(b"good".to_vec(), Duration::from_millis(delay_ms))
}

fn bad(delay_ms: u64) -> MockBehavior {
    MockBehavior::reply_with(b"bad".to_vec(), Duration::from_millis(delay_ms))
}

fn addr(byte: u8) -> ServerAddr {
    peer_info(byte).address
}

// =============================================================================
// TEST GROUP 1: Happy Path
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_valid_response_resolves() {
    let h = harness(RetrieveConfig::for_testing());
    let peer = h.add_peer(1, good(20));

    let result = h.manager.retrieve(request("a"), accept_good()).await;
    assert_eq!(result.unwrap(), b"good".to_vec());
    assert_eq!(peer.send_count(), 1);
    assert_eq!(h.manager.stats().validated, 1);
    assert_eq!(h.manager.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_success_feeds_latency_back() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, good(40));

    h.manager.retrieve(request("a"), accept_good()).await.unwrap();

    let rtt = h.registry.get(&node_id(1)).unwrap().rtt.unwrap();
    assert!(rtt >= Duration::from_millis(40));
    let record = h.pool.record(&addr(1)).unwrap();
    assert_eq!(record.failure_streak, 0);
    assert!(record.latency_ewma_ms.unwrap() >= 40.0);
}

// =============================================================================
// TEST GROUP 2: Deduplication
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_dispatch() {
    let h = harness(RetrieveConfig::for_testing());
    let peer = h.add_peer(1, good(50));

    let waiters: Vec<Waiter> = (0..5)
        .map(|_| h.manager.join(request("same"), accept_good()).unwrap())
        .collect();
    assert_eq!(h.manager.waiter_count(&request("same").key), 5);

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), b"good".to_vec());
    }
    assert_eq!(peer.send_count(), 1);
    assert_eq!(h.manager.stats().deduplicated, 4);
}

#[tokio::test(start_paused = true)]
async fn test_all_callers_receive_same_failure() {
    let mut config = RetrieveConfig::for_testing();
    config.max_attempts = 1;
    let h = harness(config);
    h.add_peer(1, MockBehavior::Silent);

    let first = h.manager.join(request("k"), accept_good()).unwrap();
    let second = h.manager.join(request("k"), accept_good()).unwrap();

    let expected = Err(RetrieveError::Exhausted { attempts: 1 });
    assert_eq!(first.await, expected);
    assert_eq!(second.await, expected);
}

#[tokio::test(start_paused = true)]
async fn test_one_caller_leaving_does_not_cancel_others() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, good(50));

    let leaving = h.manager.join(request("k"), accept_good()).unwrap();
    let staying = h.manager.join(request("k"), accept_good()).unwrap();
    leaving.cancel();

    assert_eq!(staying.await.unwrap(), b"good".to_vec());
}

// =============================================================================
// TEST GROUP 3: Retry with Peer Rotation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalid_response_demotes_and_retries_elsewhere() {
    let h = harness(RetrieveConfig::for_testing());
    let liar = h.add_peer(1, bad(5));
    let honest = h.add_peer(2, good(20));

    let result = h.manager.retrieve(request("k"), accept_good()).await;
    assert_eq!(result.unwrap(), b"good".to_vec());
    assert_eq!(liar.send_count(), 1);
    assert_eq!(honest.send_count(), 1);
    assert_eq!(h.pool.record(&addr(1)).unwrap().failure_streak, 1);
    assert_eq!(h.pool.record(&addr(2)).unwrap().failure_streak, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_rotates_to_next_peer() {
    let h = harness(RetrieveConfig::for_testing());
    let silent = h.add_peer(1, MockBehavior::Silent);
    h.add_peer(2, good(10));

    let key = request("k").key;
    let waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.manager.phase(&key), Some(Phase::InFlight));

    assert_eq!(waiter.await.unwrap(), b"good".to_vec());
    assert_eq!(silent.send_count(), 1);
    assert_eq!(h.pool.record(&addr(1)).unwrap().failure_streak, 1);
}

#[tokio::test(start_paused = true)]
async fn test_peer_disconnect_redispatches_without_caller() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, MockBehavior::Silent);
    let backup = h.add_peer(2, good(10));

    let key = request("k").key;
    let waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.manager.has_active_slot(&key));

    h.registry.remove(&node_id(1)).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let history = h.manager.history(&key).unwrap();
    assert_eq!(history[0].outcome, SlotOutcome::PeerDisconnected);

    assert_eq!(waiter.await.unwrap(), b"good".to_vec());
    assert_eq!(backup.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_rotates_peer() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, MockBehavior::RejectSend);
    h.add_peer(2, good(10));

    let result = h.manager.retrieve(request("k"), accept_good()).await;
    assert_eq!(result.unwrap(), b"good".to_vec());
    assert_eq!(h.pool.record(&addr(1)).unwrap().failure_streak, 1);
    assert_eq!(h.manager.stats().attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_send_times_out_and_rotates() {
    let h = harness(RetrieveConfig::for_testing());
    let stuck = h.add_peer(1, MockBehavior::HangSend);
    h.add_peer(2, good(10));

    let key = request("k").key;
    let waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.manager.phase(&key), Some(Phase::InFlight));
    assert_eq!(stuck.send_count(), 1);

    assert_eq!(waiter.await.unwrap(), b"good".to_vec());
    assert_eq!(h.pool.record(&addr(1)).unwrap().failure_streak, 1);
    assert_eq!(h.registry.get(&node_id(1)).unwrap().in_flight, 0);
    assert_eq!(h.registry.active_slots(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_phase_returns_to_pending_after_failed_attempt() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, MockBehavior::Silent);

    let key = request("k").key;
    let _waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let history = h.manager.history(&key).unwrap();
    assert_eq!(history[0].outcome, SlotOutcome::TimedOut);
    assert_eq!(h.manager.phase(&key), Some(Phase::Pending));
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_active_slot_per_key() {
    let h = harness(RetrieveConfig::for_testing());
    for byte in 1..=3 {
        h.add_peer(byte, MockBehavior::Silent);
    }

    let _waiter = h.manager.join(request("k"), accept_good()).unwrap();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(37)).await;
        assert!(h.registry.active_slots() <= 1);
    }
}

// =============================================================================
// TEST GROUP 4: Exhaustion and Deadlines
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_all_peers_excluded_resolves_exhausted_at_deadline() {
    let config = RetrieveConfig::for_testing();
    let deadline = config.request_deadline();
    let h = harness(config);
    h.add_peer(1, MockBehavior::Silent);
    h.add_peer(2, MockBehavior::Silent);

    let start = Instant::now();
    let result = h.manager.retrieve(request("k"), accept_good()).await;
    let elapsed = start.elapsed();

    assert_eq!(result, Err(RetrieveError::Exhausted { attempts: 2 }));
    assert!(elapsed >= deadline);
    assert!(elapsed < deadline + Duration::from_millis(50));
    assert_eq!(h.manager.stats().exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_peers_resolves_exhausted_without_overrunning_deadline() {
    let config = RetrieveConfig::for_testing();
    let deadline = config.request_deadline();
    let h = harness(config);

    let start = Instant::now();
    let result = h.manager.retrieve(request("k"), accept_good()).await;
    assert_eq!(result, Err(RetrieveError::Exhausted { attempts: 0 }));
    assert!(start.elapsed() < deadline + Duration::from_millis(50));
}

#[tokio::test(start_paused = true)]
async fn test_hung_send_cannot_overrun_deadline() {
    let config = RetrieveConfig::for_testing();
    let deadline = config.request_deadline();
    let h = harness(config);
    h.add_peer(1, MockBehavior::HangSend);

    let start = Instant::now();
    let result = h.manager.retrieve(request("k"), accept_good()).await;
    assert_eq!(result, Err(RetrieveError::Exhausted { attempts: 1 }));
    assert!(start.elapsed() < deadline + Duration::from_millis(50));
    assert_eq!(h.registry.active_slots(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_budget_exhausts() {
    let mut config = RetrieveConfig::for_testing();
    config.max_attempts = 2;
    let h = harness(config);
    let peers: Vec<_> = (1..=3).map(|b| h.add_peer(b, MockBehavior::Silent)).collect();

    let result = h.manager.retrieve(request("k"), accept_good()).await;
    assert_eq!(result, Err(RetrieveError::Exhausted { attempts: 2 }));
    let total: usize = peers.iter().map(|p| p.send_count()).sum();
    assert_eq!(total, 2);
}

#[tokio::test(start_paused = true)]
async fn test_waits_for_peer_to_join() {
    let h = harness(RetrieveConfig::for_testing());

    let waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.manager.phase(&request("k").key), Some(Phase::Pending));

    h.add_peer(1, good(10));
    assert_eq!(waiter.await.unwrap(), b"good".to_vec());
}

// =============================================================================
// TEST GROUP 5: Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_only_waiter_stops_retries_and_ignores_stale_response() {
    let h = harness(RetrieveConfig::for_testing());
    let silent = h.add_peer(1, MockBehavior::Silent);

    let waiter = h.manager.join(request("k1"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let (stale_id, _) = silent.sent()[0].clone();
    waiter.cancel();

    assert_eq!(h.manager.pending_count(), 0);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(silent.send_count(), 1);
    assert_eq!(h.registry.active_slots(), 0);
    assert_eq!(h.manager.stats().canceled, 1);

    // Cancellation never penalizes the peer.
    assert!(h.pool.record(&addr(1)).is_none());

    // A late answer for the abandoned slot cannot reach another request.
    silent.set_behavior(good(50));
    let other = h.manager.join(request("k2"), accept_good()).unwrap();
    assert!(!h.registry.deliver(&node_id(1), stale_id, b"bad".to_vec()));
    assert_eq!(other.await.unwrap(), b"good".to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_hung_send_releases_slot() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, MockBehavior::HangSend);

    let key = request("k").key;
    let waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(h.manager.has_active_slot(&key));

    waiter.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.registry.active_slots(), 0);
    assert_eq!(h.registry.get(&node_id(1)).unwrap().in_flight, 0);
    assert!(h.pool.record(&addr(1)).is_none());
}

#[tokio::test]
async fn test_malformed_request_fails_immediately() {
    let h = harness(RetrieveConfig::for_testing());
    let peer = h.add_peer(1, good(1));

    let empty = RetrieveRequest::new(RequestKey::derive("test", b""), Vec::new());
    let err = h.manager.join(empty, accept_good()).unwrap_err();
    assert!(matches!(err, RetrieveError::MalformedRequest(_)));
    assert_eq!(peer.send_count(), 0);
    assert_eq!(h.manager.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_and_refuses_new() {
    let h = harness(RetrieveConfig::for_testing());
    h.add_peer(1, MockBehavior::Silent);

    let waiter = h.manager.join(request("k"), accept_good()).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(h.manager.stop(), 1);
    assert_eq!(waiter.await, Err(RetrieveError::Canceled));
    assert_eq!(
        h.manager.join(request("k"), accept_good()).unwrap_err(),
        RetrieveError::Stopped
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.registry.active_slots(), 0);
}
