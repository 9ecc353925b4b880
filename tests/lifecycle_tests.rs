//! Peer lifecycle invariants and the async service plumbing.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use ember_node::config::Network;
use ember_node::network::protocol::{frame_message, Hash256, Message, NODE_NETWORK, PROTOCOL_VERSION};
use ember_node::network::NetworkService;

#[test]
fn test_finalize_clears_in_flight_and_counters() {
    let h = harness();
    let peer = h.connected_peer();
    h.ctx
        .requester
        .mark_block_in_flight(Hash256::from_byte(1), peer.id, 1);
    h.ctx
        .requester
        .mark_block_in_flight(Hash256::from_byte(2), peer.id, 2);
    {
        let mut main = h.ctx.main.lock();
        let state = main.node_states.get_mut(peer.id).unwrap();
        state.sync_started = true;
    }
    h.ctx.sync_started.fetch_add(1, Ordering::AcqRel);

    h.ctx.finalize_peer(peer.id);

    // No entry in the in-flight map references the departed peer; after the
    // last peer the map and counters are clean.
    assert_eq!(h.ctx.requester.num_blocks_in_flight(peer.id), 0);
    assert!(h.ctx.requester.in_flight_is_empty());
    assert_eq!(h.ctx.preferred_download.load(Ordering::Acquire), 0);
    assert_eq!(h.ctx.sync_started.load(Ordering::Acquire), 0);
    assert_eq!(h.ctx.peer_count(), 0);
    assert!(h.ctx.main.lock().node_states.get(peer.id).is_none());
}

#[test]
fn test_finalize_is_idempotent() {
    let h = harness();
    let peer = h.connected_peer();
    h.ctx.finalize_peer(peer.id);
    h.ctx.finalize_peer(peer.id);
    assert_eq!(h.ctx.peer_count(), 0);
}

#[test]
fn test_blocks_requeue_after_peer_departure() {
    let h = harness();
    let p1 = h.connected_peer();
    let hash = Hash256::from_byte(4);
    assert!(h.ctx.requester.mark_block_in_flight(hash, p1.id, 10));
    h.ctx.finalize_peer(p1.id);

    // Another peer can take the block immediately.
    let p2 = h.connected_peer();
    assert!(h.ctx.requester.mark_block_in_flight(hash, p2.id, 11));
}

#[test]
fn test_abort_contract_sets_warning_and_shutdown() {
    let h = harness();
    assert!(!h.ctx.shutdown_requested());
    h.ctx.abort_node("Disk space is low!");
    assert!(h.ctx.shutdown_requested());
    assert_eq!(h.ctx.warning(), Some("Disk space is low!".to_string()));
}

/// Full async path: the transport enqueues frames, the worker dispatches
/// them, and replies land in the send queue.
#[tokio::test]
async fn test_service_processes_enqueued_messages() {
    let h = harness();
    let service = NetworkService::new(h.ctx.clone());

    let peer = h.ctx.initialize_peer(
        "8.8.4.1:8343".parse().unwrap(),
        true,
        false,
        false,
        false,
        TEST_NOW,
    );
    service.attach_peer(peer.clone());

    let magic = Network::Main.magic();
    peer.enqueue_incoming(frame_message(
        magic,
        &Message::Version(version_msg(7, 900_000, NODE_NETWORK, PROTOCOL_VERSION)),
        now_micros(),
    ));
    peer.enqueue_incoming(frame_message(magic, &Message::Verack, now_micros()));

    // Wait for the worker to finish the handshake.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !peer.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "handshake timed out");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    peer.drain_send_queue();

    peer.enqueue_incoming(frame_message(magic, &Message::Ping(Some(42)), now_micros()));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let sent = peer.drain_send_queue();
        if sent.iter().any(|m| *m == Message::Pong(Some(42))) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pong timed out");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    service.shutdown().await;
    // The worker finalized the peer on the way out.
    assert_eq!(h.ctx.peer_count(), 0);
}
