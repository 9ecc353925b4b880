//! Ping/pong round trips and the keepalive schedule.

mod common;

use common::*;
use ember_node::network::protocol::{Message, PING_INTERVAL};
use ember_node::network::sender;

#[test]
fn test_ping_echoes_nonce_as_pong() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(h.handle(&peer, Message::Ping(Some(0xABCD))));
    let sent = peer.drain_send_queue();
    assert_eq!(sent, vec![Message::Pong(Some(0xABCD))]);
}

#[test]
fn test_nonceless_ping_gets_no_pong() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(h.handle(&peer, Message::Ping(None)));
    assert!(peer.drain_send_queue().is_empty());
}

#[test]
fn test_pong_nonce_mismatch_keeps_ping_outstanding() {
    let h = harness();
    let peer = h.connected_peer();
    peer.record_ping_sent(7, now_micros() - 50_000);

    // A mismatched nonce is logged but the ping stays outstanding.
    assert!(h.handle(&peer, Message::Pong(Some(8))));
    assert_eq!(peer.info.lock().ping_nonce_sent, 7);

    // The matching nonce completes it and records the round trip.
    assert!(h.handle(&peer, Message::Pong(Some(7))));
    let info = peer.info.lock();
    assert_eq!(info.ping_nonce_sent, 0);
    assert!(info.last_ping_micros.is_some());
}

#[test]
fn test_pong_nonce_zero_cancels_ping() {
    let h = harness();
    let peer = h.connected_peer();
    peer.record_ping_sent(7, now_micros());
    assert!(h.handle(&peer, Message::Pong(Some(0))));
    assert_eq!(peer.info.lock().ping_nonce_sent, 0);
    assert!(peer.info.lock().last_ping_micros.is_none());
}

#[test]
fn test_short_pong_cancels_ping() {
    let h = harness();
    let peer = h.connected_peer();
    peer.record_ping_sent(7, now_micros());
    assert!(h.handle(&peer, Message::Pong(None)));
    assert_eq!(peer.info.lock().ping_nonce_sent, 0);
}

#[test]
fn test_unsolicited_pong_is_harmless() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(h.handle(&peer, Message::Pong(Some(5))));
    assert!(!peer.is_disconnecting());
    assert_eq!(
        peer.misbehavior.load(std::sync::atomic::Ordering::Acquire),
        0
    );
}

#[test]
fn test_sender_ping_schedule() {
    let h = harness();
    let peer = h.connected_peer();

    // Never pinged: the first tick probes immediately.
    sender::send_messages(&h.ctx, &peer, now_micros());
    assert_eq!(drain_of(&peer, "ping").len(), 1);
    let nonce = peer.info.lock().ping_nonce_sent;
    assert_ne!(nonce, 0);

    // Keep the header-sync timeout out of this test's way.
    h.ctx
        .main
        .lock()
        .node_states
        .get_mut(peer.id)
        .unwrap()
        .first_headers_received = true;

    // While the ping is outstanding, no new one is emitted.
    sender::send_messages(&h.ctx, &peer, now_micros() + PING_INTERVAL * 2_000_000);
    assert!(drain_of(&peer, "ping").is_empty());

    // Once answered, the next interval expiry pings again.
    assert!(peer.record_pong(nonce, now_micros() + 1_000));
    sender::send_messages(&h.ctx, &peer, now_micros() + PING_INTERVAL * 3_000_000);
    assert_eq!(drain_of(&peer, "ping").len(), 1);
}

#[test]
fn test_queued_ping_sends_immediately() {
    let h = harness();
    let peer = h.connected_peer();
    peer.info.lock().ping_queued = true;
    sender::send_messages(&h.ctx, &peer, now_micros());
    let pings = drain_of(&peer, "ping");
    assert_eq!(pings.len(), 1);
    match &pings[0] {
        Message::Ping(Some(nonce)) => assert_ne!(*nonce, 0),
        other => panic!("unexpected {:?}", other),
    }
    assert_ne!(peer.info.lock().ping_nonce_sent, 0);
}
