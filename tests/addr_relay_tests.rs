//! Address gossip: reachability-gated storage and relay fanout.

mod common;

use std::sync::Arc;

use common::*;
use ember_node::network::peer::Peer;
use ember_node::network::protocol::{Message, NetAddress, NODE_NETWORK};

fn fresh_addr(s: &str) -> NetAddress {
    NetAddress::from_socket_addr(s.parse().unwrap(), NODE_NETWORK, TEST_NOW as u32)
}

fn relay_count(targets: &[Arc<Peer>], addr: &NetAddress) -> usize {
    targets
        .iter()
        .map(|t| {
            t.with_send_queue(|send| {
                send.addr_to_send
                    .iter()
                    .filter(|a| a.key() == addr.key())
                    .count()
            })
        })
        .sum()
}

#[test]
fn test_addr_relay_fanout_by_reachability() {
    // Default config: v4-only node, IPv6 unreachable.
    let h = harness();
    let targets: Vec<Arc<Peer>> = (0..3).map(|_| h.connected_peer()).collect();
    let source = h.connected_peer();

    let v4 = fresh_addr("93.184.216.34:8343");
    let v6 = fresh_addr("[2001:4860:4860::8888]:8343");
    assert!(h.handle(&source, Message::Addr(vec![v4, v6])));

    // Both are routable and fresh, so both relay; the unreachable network
    // reaches half as many peers.
    assert_eq!(relay_count(&targets, &v4), 2);
    assert_eq!(relay_count(&targets, &v6), 1);

    // Only the reachable address enters the address book.
    let kept = h.addrbook.known.lock();
    assert!(kept.iter().any(|a| a.key() == v4.key()));
    assert!(!kept.iter().any(|a| a.key() == v6.key()));
}

#[test]
fn test_unroutable_addr_not_relayed_but_reachable_rules_storage() {
    let h = harness();
    let targets: Vec<Arc<Peer>> = (0..2).map(|_| h.connected_peer()).collect();
    let source = h.connected_peer();

    // Private v4 space: reachable network, but never relayed.
    let private = fresh_addr("192.168.1.20:8343");
    assert!(h.handle(&source, Message::Addr(vec![private])));
    assert_eq!(relay_count(&targets, &private), 0);
    // Storage follows reachability; the external address book applies its
    // own quality rules.
    assert!(h
        .addrbook
        .known
        .lock()
        .iter()
        .any(|a| a.key() == private.key()));
}

#[test]
fn test_solicited_addr_batches_are_not_relayed() {
    let h = harness();
    let targets: Vec<Arc<Peer>> = (0..2).map(|_| h.connected_peer()).collect();
    let source = h.connected_peer();
    source.info.lock().getaddr_in_flight = true;

    let addr = fresh_addr("93.184.216.34:8343");
    assert!(h.handle(&source, Message::Addr(vec![addr])));
    assert_eq!(relay_count(&targets, &addr), 0, "getaddr replies never relay");
    // The reply still resolves the outstanding solicitation.
    assert!(!source.info.lock().getaddr_in_flight);
}
