//! Adversarial input handling: size caps, envelope gates, misbehavior
//! boundaries.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use ember_node::config::{ChainParams, Network, NodeConfig};
use ember_node::network::dispatcher;
use ember_node::network::protocol::{
    frame_message, FilterLoadMessage, Hash256, InvKind, Message, NetMessage, RawInv,
    MAX_BLOOM_FILTER_SIZE, MAX_INV_SZ, MAX_SCRIPT_ELEMENT_SIZE, NODE_NETWORK,
};

fn tx_invs(count: usize) -> Vec<RawInv> {
    (0..count)
        .map(|i| RawInv {
            kind: InvKind::Tx.to_u32(),
            hash: {
                let mut h = [0u8; 32];
                h[0..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
                Hash256(h)
            },
        })
        .collect()
}

#[test]
fn test_empty_inv_earns_twenty_points() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(!h.handle(&peer, Message::Inv(vec![])));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 20);
}

#[test]
fn test_oversized_inv_earns_twenty_points() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(!h.handle(&peer, Message::Inv(tx_invs(MAX_INV_SZ + 1))));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 20);
}

#[test]
fn test_maximum_inv_is_accepted() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(h.handle(&peer, Message::Inv(tx_invs(MAX_INV_SZ))));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 0);
}

#[test]
fn test_unknown_inv_kind_earns_twenty_points() {
    let h = harness();
    let peer = h.connected_peer();
    let bad = vec![RawInv {
        kind: 99,
        hash: Hash256::from_byte(1),
    }];
    assert!(!h.handle(&peer, Message::Inv(bad)));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 20);
}

#[test]
fn test_empty_getdata_earns_twenty_points() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(!h.handle(&peer, Message::GetData(vec![])));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 20);
}

#[test]
fn test_filteradd_boundary() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(h.handle(
        &peer,
        Message::FilterLoad(FilterLoadMessage {
            data: vec![0u8; 256],
            hash_funcs: 5,
            tweak: 1,
            flags: 1,
        })
    ));

    // Exactly the cap is fine.
    assert!(h.handle(
        &peer,
        Message::FilterAdd {
            data: vec![0u8; MAX_SCRIPT_ELEMENT_SIZE]
        }
    ));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 0);

    // One past it is a full-score violation.
    assert!(!h.handle(
        &peer,
        Message::FilterAdd {
            data: vec![0u8; MAX_SCRIPT_ELEMENT_SIZE + 1]
        }
    ));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 100);
}

#[test]
fn test_filteradd_without_filter_is_misbehavior() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(!h.handle(&peer, Message::FilterAdd { data: vec![1, 2] }));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 100);
}

#[test]
fn test_oversized_filterload_is_misbehavior() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(!h.handle(
        &peer,
        Message::FilterLoad(FilterLoadMessage {
            data: vec![0u8; MAX_BLOOM_FILTER_SIZE + 1],
            hash_funcs: 5,
            tweak: 1,
            flags: 0,
        })
    ));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 100);
}

#[test]
fn test_filter_messages_banned_without_bloom_service() {
    let mut config = NodeConfig::default();
    config.services = NODE_NETWORK; // no NODE_BLOOM
    let h = harness_with(10, TEST_NOW - 60, config);
    let peer = h.connected_peer();
    assert!(!h.handle(&peer, Message::FilterClear));
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 100);
    assert!(h.ctx.dos.is_banned(peer.addr.ip(), TEST_NOW));
}

#[test]
fn test_wrong_magic_bans_for_four_hours() {
    let h = harness();
    let peer = h.connected_peer();
    let mut framed = frame_message(
        ChainParams::new(Network::Main).magic(),
        &Message::Ping(Some(1)),
        now_micros(),
    );
    framed.header.magic = Network::Testnet.magic();
    peer.enqueue_incoming(framed);

    let ok = dispatcher::process_messages(&h.ctx, &peer, &h.cancel);
    assert!(!ok);
    assert!(peer.is_disconnecting());
    assert!(h.ctx.dos.is_banned(peer.addr.ip(), TEST_NOW + 4 * 3600 - 1));
    assert!(!h.ctx.dos.is_banned(peer.addr.ip(), TEST_NOW + 4 * 3600 + 1));
}

#[test]
fn test_checksum_mismatch_skips_message() {
    let h = harness();
    let peer = h.connected_peer();
    let mut framed = frame_message(Network::Main.magic(), &Message::Ping(Some(1)), now_micros());
    framed.header.checksum = [0xde, 0xad, 0xbe, 0xef];
    peer.enqueue_incoming(framed);

    let ok = dispatcher::process_messages(&h.ctx, &peer, &h.cancel);
    assert!(ok, "checksum miss keeps the connection");
    assert!(!peer.is_disconnecting());
    // No pong was produced.
    assert!(peer.drain_send_queue().is_empty());
}

#[test]
fn test_undecodable_payload_answers_with_reject() {
    let h = harness();
    let peer = h.connected_peer();
    // sendcmpct with a one-byte payload cannot decode.
    let framed = NetMessage {
        header: frame_message(Network::Main.magic(), &Message::Ping(Some(1)), 0).header,
        payload: bytes::Bytes::from_static(&[1]),
        received_at: now_micros(),
    };
    let mut framed = framed;
    framed.header.command = *b"sendcmpct\0\0\0";
    framed.header.length = 1;
    framed.header.checksum = ember_node::network::protocol::payload_checksum(&framed.payload);
    peer.enqueue_incoming(framed);

    assert!(dispatcher::process_messages(&h.ctx, &peer, &h.cancel));
    let sent = peer.drain_send_queue();
    assert!(sent.iter().any(|m| matches!(
        m,
        Message::Reject(r) if r.message == "sendcmpct"
    )));
    assert!(!peer.is_disconnecting());
}

#[test]
fn test_unknown_command_is_ignored() {
    let h = harness();
    let peer = h.connected_peer();
    assert!(h.handle(
        &peer,
        Message::Unknown {
            command: "frobnicate".into()
        }
    ));
    assert!(!peer.is_disconnecting());
    assert_eq!(peer.misbehavior.load(Ordering::Acquire), 0);
}

#[test]
fn test_whitelisted_peer_not_banned_on_bad_magic() {
    let h = harness();
    let peer = h.ctx.initialize_peer(
        "8.8.9.1:8343".parse().unwrap(),
        true,
        true,
        false,
        false,
        TEST_NOW,
    );
    let mut framed = frame_message(Network::Main.magic(), &Message::Ping(Some(1)), now_micros());
    framed.header.magic = Network::Regtest.magic();
    peer.enqueue_incoming(framed);

    assert!(!dispatcher::process_messages(&h.ctx, &peer, &h.cancel));
    assert!(!h.ctx.dos.is_banned(peer.addr.ip(), TEST_NOW));
}
