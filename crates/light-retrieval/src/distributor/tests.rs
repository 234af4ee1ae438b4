//! Tests for the Request Distributor

use super::*;
use crate::config::DistributorConfig;
use crate::domain::PeerFilter;
use crate::testing::{node_id, peer_info, MockBehavior, MockPeer};

struct Fixture {
    registry: Arc<PeerRegistry>,
    distributor: RequestDistributor,
    peers: Vec<Arc<MockPeer>>,
}

fn fixture(count: u8, behavior: MockBehavior) -> Fixture {
    let registry = Arc::new(PeerRegistry::new(DistributorConfig::for_testing()));
    let peers = (1..=count)
        .map(|byte| {
            let peer = MockPeer::new(peer_info(byte), &registry, behavior.clone());
            registry.add(peer.clone()).unwrap();
            peer
        })
        .collect();
    Fixture {
        distributor: RequestDistributor::new(Arc::clone(&registry)),
        registry,
        peers,
    }
}

fn key() -> RequestKey {
    RequestKey::derive("test", b"k")
}

async fn dispatch_with(
    distributor: &RequestDistributor,
    excluded: &HashSet<NodeId>,
    recent: &HashMap<NodeId, Instant>,
) -> Result<DistributionSlot, DispatchError> {
    let filter = PeerFilter::any();
    distributor
        .dispatch(&DispatchRequest {
            key: key(),
            payload: b"payload",
            filter: &filter,
            excluded,
            recent,
        })
        .await
}

// =============================================================================
// TEST GROUP 1: Selection
// =============================================================================

#[tokio::test]
async fn test_excluded_peer_skipped_lower_latency_preferred() {
    let f = fixture(3, MockBehavior::Silent);
    f.registry.observe_latency(&node_id(1), Duration::from_millis(5));
    f.registry.observe_latency(&node_id(2), Duration::from_millis(80));
    f.registry.observe_latency(&node_id(3), Duration::from_millis(20));

    let excluded: HashSet<NodeId> = [node_id(1)].into_iter().collect();
    let slot = dispatch_with(&f.distributor, &excluded, &HashMap::new())
        .await
        .unwrap();
    assert_eq!(slot.peer().id, node_id(3));
    assert_eq!(f.peers[0].send_count(), 0);
}

#[tokio::test]
async fn test_tie_broken_by_least_recent_use_for_key() {
    let f = fixture(2, MockBehavior::Silent);
    let mut recent = HashMap::new();
    recent.insert(node_id(1), Instant::now());

    let slot = dispatch_with(&f.distributor, &HashSet::new(), &recent)
        .await
        .unwrap();
    assert_eq!(slot.peer().id, node_id(2));
}

#[tokio::test]
async fn test_all_excluded_is_no_peer_available() {
    let f = fixture(2, MockBehavior::Silent);
    let excluded: HashSet<NodeId> = [node_id(1), node_id(2)].into_iter().collect();
    let result = dispatch_with(&f.distributor, &excluded, &HashMap::new()).await;
    assert_eq!(result.err(), Some(DispatchError::NoPeerAvailable));
}

#[tokio::test]
async fn test_peers_at_capacity_are_skipped() {
    let f = fixture(1, MockBehavior::Silent);
    let capacity = DistributorConfig::for_testing().default_capacity;
    let mut held = Vec::new();
    for _ in 0..capacity {
        held.push(
            dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
                .await
                .unwrap(),
        );
    }
    let result = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new()).await;
    assert_eq!(result.err(), Some(DispatchError::NoPeerAvailable));

    drop(held.pop());
    assert!(dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
        .await
        .is_ok());
}

// =============================================================================
// TEST GROUP 2: Slot Lifecycle
// =============================================================================

#[tokio::test]
async fn test_send_failure_releases_slot() {
    let f = fixture(1, MockBehavior::RejectSend);
    let result = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new()).await;
    match result {
        Err(DispatchError::SendFailed { peer, .. }) => assert_eq!(peer, node_id(1)),
        other => panic!("expected SendFailed, got {:?}", other.err()),
    }
    assert_eq!(f.registry.active_slots(), 0);
    assert_eq!(f.registry.get(&node_id(1)).unwrap().in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_dropped_mid_send_releases_slot() {
    let f = fixture(1, MockBehavior::HangSend);
    let result = tokio::time::timeout(
        Duration::from_millis(100),
        dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new()),
    )
    .await;
    assert!(result.is_err());
    assert_eq!(f.peers[0].send_count(), 1);
    assert_eq!(f.registry.get(&node_id(1)).unwrap().in_flight, 0);
    assert_eq!(f.registry.active_slots(), 0);
}

#[tokio::test]
async fn test_reserve_holds_capacity_until_slot_drops() {
    let f = fixture(1, MockBehavior::Silent);
    let filter = PeerFilter::any();
    let (excluded, recent) = (HashSet::new(), HashMap::new());
    let request = DispatchRequest {
        key: key(),
        payload: b"payload",
        filter: &filter,
        excluded: &excluded,
        recent: &recent,
    };
    let slot = f.distributor.reserve(&request).unwrap();
    assert_eq!(f.registry.get(&node_id(1)).unwrap().in_flight, 1);
    assert_eq!(f.peers[0].send_count(), 0);

    drop(slot);
    assert_eq!(f.registry.get(&node_id(1)).unwrap().in_flight, 0);
}

#[tokio::test]
async fn test_finish_releases_once_and_drop_does_not_double_release() {
    let f = fixture(1, MockBehavior::Silent);
    let slot = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(f.registry.get(&node_id(1)).unwrap().in_flight, 1);

    slot.finish(SlotOutcome::TimedOut);
    assert_eq!(f.registry.get(&node_id(1)).unwrap().in_flight, 0);
    assert_eq!(f.registry.active_slots(), 0);
}

#[tokio::test]
async fn test_dropped_slot_is_abandoned_and_late_response_discarded() {
    let f = fixture(1, MockBehavior::Silent);
    let slot = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
        .await
        .unwrap();
    let id = slot.id();
    drop(slot);

    assert_eq!(f.registry.active_slots(), 0);
    assert!(!f.registry.deliver(&node_id(1), id, vec![1]));
}

#[tokio::test(start_paused = true)]
async fn test_wait_receives_response() {
    let f = fixture(
        1,
        MockBehavior::reply_with(vec![9, 9], Duration::from_millis(30)),
    );
    let mut slot = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
        .await
        .unwrap();
    assert_eq!(slot.wait().await, SlotEvent::Response(vec![9, 9]));
    assert!(slot.finish(SlotOutcome::DeliveredValid) >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_wait_sees_peer_gone_on_removal() {
    let f = fixture(1, MockBehavior::Silent);
    let mut slot = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
        .await
        .unwrap();
    f.registry.remove(&node_id(1)).unwrap();
    assert_eq!(slot.wait().await, SlotEvent::PeerGone);
}

#[tokio::test]
async fn test_request_id_on_wire_is_slot_id() {
    let f = fixture(1, MockBehavior::Silent);
    let slot = dispatch_with(&f.distributor, &HashSet::new(), &HashMap::new())
        .await
        .unwrap();
    let sent = f.peers[0].sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, slot.id());
    assert_eq!(sent[0].1, b"payload".to_vec());
}
