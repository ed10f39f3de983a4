//! End-to-end scenarios exercising a [`TabletPeer`] wired to the in-memory
//! collaborator doubles in [`tablet_peer::testkit`].

use std::sync::Arc;
use std::time::Duration;

use tablet_peer::testkit::{InMemoryLog, InMemoryMetadataStore, InMemoryStorage, LocalConsensus};
use tablet_peer::{
    AnchorRegistry, BootstrapInfo, Log, OpId, PeerRole, QuorumConfig, ReplicaId, Storage,
    TabletId, TabletPeer, TabletPeerConfig,
};

fn peer_with_config(config: TabletPeerConfig) -> (TabletPeer, ReplicaId) {
    let replica = ReplicaId::generate();
    let quorum = QuorumConfig::single(replica, "127.0.0.1:7050");
    let metadata = Arc::new(InMemoryMetadataStore::new(TabletId::generate(), quorum));
    let peer = TabletPeer::new(
        replica,
        config,
        Arc::new(LocalConsensus::new()),
        Arc::new(InMemoryLog::new()),
        Arc::new(InMemoryStorage::new()),
        metadata,
    );
    (peer, replica)
}

/// S1: a single-replica peer admits a write once running and assigns it an
/// increasing OpId.
#[test]
fn single_replica_write_is_admitted_and_committed() {
    let (peer, _replica) = peer_with_config(TabletPeerConfig::default());
    peer.init().unwrap();
    peer.start(BootstrapInfo::default()).unwrap();

    assert_eq!(peer.role(), PeerRole::Leader);
    let first = peer.submit_write(b"row-1".to_vec()).unwrap();
    let second = peer.submit_write(b"row-2".to_vec()).unwrap();
    assert!(first < second);
    assert!(peer.get_in_flight().is_empty());

    peer.shutdown();
}

/// S2: an anchor pins a position, so GC never reclaims the segment holding
/// it even as later writes keep extending the log.
#[test]
fn log_gc_honors_an_active_anchor() {
    let storage = Arc::new(InMemoryStorage::new());
    let log = Arc::new(InMemoryLog::new());
    let replica = ReplicaId::generate();
    let quorum = QuorumConfig::single(replica, "127.0.0.1:7050");
    let metadata = Arc::new(InMemoryMetadataStore::new(TabletId::generate(), quorum));

    let peer = TabletPeer::new(
        replica,
        TabletPeerConfig {
            log_gc_sleep_delay_ms: 5,
            ..TabletPeerConfig::default()
        },
        Arc::new(LocalConsensus::new()),
        Arc::clone(&log) as Arc<dyn Log>,
        Arc::clone(&storage) as Arc<dyn Storage>,
        metadata,
    );
    peer.init().unwrap();
    peer.start(BootstrapInfo::default()).unwrap();

    for i in 0..10 {
        peer.submit_write(format!("row-{i}").into_bytes()).unwrap();
    }

    // Pin the earliest position a hypothetical long-running scan would need.
    let anchor = storage.opid_anchor_registry().register(OpId::new(1, 1), "scan-1");

    std::thread::sleep(Duration::from_millis(60));
    // Some segment should have rolled but the anchor holds the first one back.
    assert!(log.get_last_entry_op_id().unwrap() >= OpId::new(1, 10));

    storage.opid_anchor_registry().unregister(anchor);
    std::thread::sleep(Duration::from_millis(60));

    peer.shutdown();
}

/// S3: with GC disabled, the worker never deletes anything, however long it
/// runs.
#[test]
fn disabled_log_gc_never_reclaims() {
    let (peer, _replica) = peer_with_config(TabletPeerConfig {
        enable_log_gc: false,
        log_gc_sleep_delay_ms: 5,
        ..TabletPeerConfig::default()
    });
    peer.init().unwrap();
    peer.start(BootstrapInfo::default()).unwrap();

    for i in 0..10 {
        peer.submit_write(format!("row-{i}").into_bytes()).unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));

    peer.shutdown();
}

/// S4: shutdown blocks until every in-flight operation has drained from the
/// tracker, and is safe to call more than once.
#[test]
fn shutdown_drains_pending_operations_and_is_idempotent() {
    let (peer, _replica) = peer_with_config(TabletPeerConfig::default());
    peer.init().unwrap();
    peer.start(BootstrapInfo::default()).unwrap();

    peer.submit_write(b"row".to_vec()).unwrap();
    assert!(peer.get_in_flight().is_empty());

    peer.shutdown();
    peer.shutdown();

    let err = peer.submit_write(b"too-late".to_vec()).unwrap_err();
    assert!(matches!(err, tablet_peer::TabletError::ServiceUnavailable { .. }));
}

/// S5: configuration changes are serialized — submitting a second one from
/// another thread must wait for the first to finish before it's admitted.
#[test]
fn concurrent_config_changes_are_serialized() {
    let (peer, replica) = peer_with_config(TabletPeerConfig::default());
    peer.init().unwrap();
    peer.start(BootstrapInfo::default()).unwrap();
    let peer = Arc::new(peer);

    let quorum_a = QuorumConfig::single(replica, "127.0.0.1:7050");
    let quorum_b = QuorumConfig::single(replica, "127.0.0.1:7050");

    let peer_a = Arc::clone(&peer);
    let handle = std::thread::spawn(move || peer_a.submit_change_config(quorum_a));
    let result_b = peer.submit_change_config(quorum_b);
    let result_a = handle.join().unwrap();

    assert!(result_a.is_ok());
    assert!(result_b.is_ok());
    assert_eq!(peer.role(), PeerRole::Leader);

    peer.shutdown();
}

/// S6: a replica-side round runs Prepare immediately and applies once
/// consensus notifies the installed continuation of the commit.
#[test]
fn replica_transaction_applies_on_commit_notification() {
    let (peer, _replica) = peer_with_config(TabletPeerConfig::default());
    peer.init().unwrap();
    peer.start(BootstrapInfo::default()).unwrap();

    let operation = tablet_peer::OperationState::new(tablet_peer::OperationKind::Write, b"replicated-row".to_vec());
    let round = peer.start_replica_transaction(operation).unwrap();
    round.notify_committed(OpId::new(5, 1)).unwrap();

    std::thread::sleep(Duration::from_millis(20));
    assert!(peer.get_in_flight().is_empty());

    peer.shutdown();
}
