//! Send-loop behavior: announcements, inventory trickle, sync bootstrap,
//! and disconnect housekeeping.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use ember_node::network::protocol::{Hash256, Inv, InvKind, Message, NODE_NETWORK, PROTOCOL_VERSION};
use ember_node::network::sender;

fn quiet_sync_state(h: &Harness, peer: &std::sync::Arc<ember_node::network::peer::Peer>) {
    let mut main = h.ctx.main.lock();
    let state = main.node_states.get_mut(peer.id).unwrap();
    state.sync_started = true;
    state.first_headers_received = true;
}

#[test]
fn test_initial_getheaders_bootstrap() {
    let h = harness();
    let peer = h.connected_peer();
    sender::send_messages(&h.ctx, &peer, now_micros());

    let getheaders = drain_of(&peer, "getheaders");
    assert_eq!(getheaders.len(), 1, "sync starts against a taller peer");
    {
        let main = h.ctx.main.lock();
        let state = main.node_states.get(peer.id).unwrap();
        assert!(state.sync_started);
        // We asked from the parent of our tip, and expect the first batch
        // to reach at least that height.
        assert_eq!(state.first_headers_expected_height, 99);
    }
    assert_eq!(h.ctx.sync_started.load(Ordering::Acquire), 1);

    // sync_started implies the peer completed the handshake.
    assert!(peer.is_connected());
}

#[test]
fn test_no_sync_from_shorter_peer() {
    let h = harness();
    let peer = h.connected_peer_with(NODE_NETWORK, PROTOCOL_VERSION);
    peer.info.lock().start_height = 10; // behind our 100-block chain
    sender::send_messages(&h.ctx, &peer, now_micros());
    assert!(drain_of(&peer, "getheaders").is_empty());
    assert!(!h.ctx.main.lock().node_states.get(peer.id).unwrap().sync_started);
}

#[test]
fn test_only_one_pruned_header_sync_source() {
    // An older tip keeps the recent-tip bypass out of the way.
    let h = harness_with(101, TEST_NOW - 8 * 3600, Default::default());
    let light1 = h.connected_peer_with(0, PROTOCOL_VERSION);
    let light2 = h.connected_peer_with(0, PROTOCOL_VERSION);

    // The first light peer may start the headers download.
    sender::send_messages(&h.ctx, &light1, now_micros());
    assert_eq!(drain_of(&light1, "getheaders").len(), 1);
    assert_eq!(
        h.ctx.sync_started_pruned.load(Ordering::Acquire),
        1
    );

    // A second one may not.
    sender::send_messages(&h.ctx, &light2, now_micros());
    assert!(drain_of(&light2, "getheaders").is_empty());
    assert!(!h.ctx.main.lock().node_states.get(light2.id).unwrap().sync_started);

    // Full nodes stay eligible regardless.
    let full = h.connected_peer();
    sender::send_messages(&h.ctx, &full, now_micros());
    assert_eq!(drain_of(&full, "getheaders").len(), 1);
    assert_eq!(
        h.ctx.sync_started_pruned.load(Ordering::Acquire),
        1
    );
}

#[test]
fn test_initial_headers_timeout_disconnects_by_default() {
    let h = harness();
    let peer = h.connected_peer();
    sender::send_messages(&h.ctx, &peer, now_micros());
    peer.drain_send_queue();
    assert!(!peer.is_disconnecting());

    let late = (TEST_NOW + h.ctx.config.initial_headers_timeout + 1) * 1_000_000;
    sender::send_messages(&h.ctx, &peer, late);
    assert!(peer.is_disconnecting());
}

#[test]
fn test_initial_headers_timeout_log_only_mode() {
    let mut config = ember_node::config::NodeConfig::default();
    config.disconnect_on_header_timeout = false;
    let h = harness_with(101, TEST_NOW - 60, config);
    let peer = h.connected_peer();
    sender::send_messages(&h.ctx, &peer, now_micros());
    peer.drain_send_queue();

    let late = (TEST_NOW + h.ctx.config.initial_headers_timeout + 1) * 1_000_000;
    sender::send_messages(&h.ctx, &peer, late);
    assert!(!peer.is_disconnecting(), "legacy mode only logs");
}

#[test]
fn test_graceful_disconnect_waits_for_in_flight_blocks() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);
    let hash = Hash256::from_byte(0x21);
    h.ctx.requester.mark_block_in_flight(hash, peer.id, 1);

    peer.request_disconnect();
    sender::send_messages(&h.ctx, &peer, now_micros());
    assert!(!peer.is_disconnecting(), "blocks still in flight");

    h.ctx.requester.block_received(&hash);
    sender::send_messages(&h.ctx, &peer, now_micros());
    assert!(peer.is_disconnecting());
}

#[test]
fn test_banned_peer_is_disconnected_by_sender() {
    let h = harness();
    let peer = h.connected_peer();
    h.ctx.dos.ban(
        peer.addr.ip(),
        ember_node::network::dos::BanReason::ManuallyAdded,
        3600,
        TEST_NOW,
    );
    sender::send_messages(&h.ctx, &peer, now_micros());
    assert!(peer.is_disconnecting());
}

#[test]
fn test_headers_announcement_for_preferring_peer() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);
    assert!(h.handle(&peer, Message::SendHeaders));

    // Peer is known to have our tip's parent, and we announce the tip.
    let (tip_hash, tip_header, parent_id) = {
        let main = h.ctx.main.lock();
        let tip = main.chain.tip().unwrap();
        let parent = main.chain.index.entry(tip).parent.unwrap();
        (
            main.chain.index.entry(tip).hash,
            main.chain.index.entry(tip).header,
            parent,
        )
    };
    h.ctx
        .main
        .lock()
        .node_states
        .get_mut(peer.id)
        .unwrap()
        .best_known_block = Some(parent_id);

    peer.push_block_hash_to_announce(tip_hash);
    sender::send_messages(&h.ctx, &peer, now_micros());

    let headers = drain_of(&peer, "headers");
    assert_eq!(headers.len(), 1);
    assert_eq!(headers[0], Message::Headers(vec![tip_header]));
    // And the sent-header watermark moved.
    let main = h.ctx.main.lock();
    let state = main.node_states.get(peer.id).unwrap();
    assert_eq!(
        state.best_header_sent.map(|id| main.chain.index.entry(id).hash),
        Some(tip_hash)
    );
}

#[test]
fn test_announcement_falls_back_to_inv_without_preference() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);
    // No sendheaders from this peer.
    let tip_hash = {
        let main = h.ctx.main.lock();
        main.chain.tip_entry().unwrap().hash
    };
    peer.push_block_hash_to_announce(tip_hash);
    sender::send_messages(&h.ctx, &peer, now_micros());

    let sent = peer.drain_send_queue();
    assert!(!sent.iter().any(|m| m.command() == "headers"));
    // The hash went out as plain inv instead.
    let invs: Vec<Inv> = sent
        .into_iter()
        .filter_map(|m| match m {
            Message::Inv(list) => Some(list),
            _ => None,
        })
        .flatten()
        .filter_map(|raw| raw.known())
        .collect();
    assert!(invs.contains(&Inv::block(tip_hash)));
}

#[test]
fn test_nonconnecting_announcement_reverts_to_inv() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);
    assert!(h.handle(&peer, Message::SendHeaders));

    // Peer has nothing of ours; tip does not connect to anything it knows.
    let tip_hash = {
        let main = h.ctx.main.lock();
        main.chain.tip_entry().unwrap().hash
    };
    peer.push_block_hash_to_announce(tip_hash);
    sender::send_messages(&h.ctx, &peer, now_micros());
    assert!(drain_of(&peer, "headers").is_empty());
}

#[test]
fn test_tx_inventory_choked_for_silent_peer() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);
    assert_eq!(peer.activity_bytes.load(Ordering::Acquire), 0);

    peer.push_inventory(Inv::tx(Hash256::from_byte(1)));
    peer.push_inventory(Inv::block(Hash256::from_byte(2)));

    // Tick more than two minutes after connect: the silent peer loses tx
    // inv but still gets block inv.
    let late = (TEST_NOW + 200) * 1_000_000;
    sender::send_messages(&h.ctx, &peer, late);
    let invs: Vec<u32> = peer
        .drain_send_queue()
        .into_iter()
        .filter_map(|m| match m {
            Message::Inv(list) => Some(list),
            _ => None,
        })
        .flatten()
        .map(|raw| raw.kind)
        .collect();
    assert_eq!(invs, vec![InvKind::Block.to_u32()]);
}

#[test]
fn test_known_tx_inventory_not_repeated() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);
    peer.activity_bytes.fetch_add(100, Ordering::AcqRel);

    let txid = Hash256::from_byte(9);
    peer.mark_inventory_known(&Inv::tx(txid));
    // push_inventory already filters known tx entries.
    peer.push_inventory(Inv::tx(txid));
    sender::send_messages(&h.ctx, &peer, now_micros());
    let invs: Vec<Message> = drain_of(&peer, "inv");
    assert!(invs.is_empty());
}

#[test]
fn test_addr_trickle_drains_in_batches() {
    let h = harness();
    let peer = h.connected_peer();
    quiet_sync_state(&h, &peer);

    for i in 0..1200u32 {
        let octets = i.to_be_bytes();
        let addr = ember_node::network::protocol::NetAddress::from_socket_addr(
            format!("7.{}.{}.{}:8343", octets[1], octets[2], octets[3])
                .parse()
                .unwrap(),
            NODE_NETWORK,
            TEST_NOW as u32,
        );
        peer.push_address(&addr);
    }

    sender::send_messages(&h.ctx, &peer, now_micros());
    let addr_batches: Vec<usize> = peer
        .drain_send_queue()
        .into_iter()
        .filter_map(|m| match m {
            Message::Addr(list) => Some(list.len()),
            _ => None,
        })
        .collect();
    // Two batches, the first at the 1000-address wire cap.
    assert_eq!(addr_batches.len(), 2);
    assert_eq!(addr_batches[0], 1000);
    assert!(addr_batches[1] <= 1000);
    assert_eq!(peer.with_send_queue(|s| s.addr_to_send.len()), 0);
}
