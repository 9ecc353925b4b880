//! Periodic per-peer send loop.
//!
//! Runs on every send-sweep tick for every live peer, in a fixed order:
//! disconnect housekeeping, handshake timeout, pings, download timeouts,
//! address gossip, block announcements (headers when possible, inv
//! otherwise), inventory trickle, and finally the next block requests.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::chain::{BlockId, Chain};
use crate::network::peer::{NodeState, Peer};
use crate::network::protocol::{
    Hash256, Inv, InvKind, Message, RawInv, AVG_ADDRESS_BROADCAST_INTERVAL,
    AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL, BIP0031_VERSION, MAX_ADDR_TO_RELAY,
    MAX_BLOCKS_TO_ANNOUNCE, MAX_INV_TO_SEND, PING_INTERVAL,
};
use crate::network::request_manager::BLOCK_REQUEST_RETRY_INTERVAL;
use crate::network::NetContext;

/// Seconds a peer may stay silent before its tx inventory is choked off.
const INV_CHOKE_IDLE_SECONDS: u64 = 120;
/// Simultaneous header-sync peers while far from the tip.
const MAX_HEADER_REQS_DURING_IBD: i32 = 3;
/// Tip age under which every peer may be asked for headers at once.
const SINGLE_PEER_REQUEST_MODE_AGE: u64 = 6 * 60 * 60;

/// Draw the next event time for a Poisson process with the given average
/// interval, in microseconds.
fn poisson_next_send(now_micros: u64, average_interval_seconds: u64) -> u64 {
    let u: f64 = 1.0 - rand::thread_rng().gen::<f64>(); // (0, 1]
    now_micros + (average_interval_seconds as f64 * 1_000_000.0 * -u.ln()) as u64
}

/// One send-loop pass for `peer`.
pub fn send_messages(ctx: &NetContext, peer: &Arc<Peer>, now_micros: u64) {
    let now = now_micros / 1_000_000;

    // Banned addresses and completed graceful disconnects go first.
    if ctx.dos.is_banned(peer.addr.ip(), now) {
        peer.set_disconnect();
    }
    if peer.disconnect_requested() && !peer.is_disconnecting() {
        let in_flight = ctx.requester.num_blocks_in_flight(peer.id);
        debug!(peer = %peer.log_name(), in_flight, "checking disconnect request");
        if in_flight == 0 {
            peer.set_disconnect();
        }
    }
    if peer.is_disconnecting() {
        return;
    }

    // Before the handshake completes, the only business is the verack
    // timeout.
    if !peer.is_connected() {
        let timed_out = {
            let info = peer.info.lock();
            match info.version_sent_at {
                Some(sent) => now.saturating_sub(sent) > ctx.config.verack_timeout,
                None => false,
            }
        };
        if timed_out {
            warn!(
                peer = %peer.log_name(),
                timeout = ctx.config.verack_timeout,
                "verack not received within timeout, disconnecting"
            );
            peer.set_disconnect();
            ctx.dos.record_eviction(peer.addr.ip(), now);
        }
        return;
    }

    maybe_send_ping(peer, now_micros);
    check_thin_download_timeouts(ctx, peer, now);
    ctx.requester.disconnect_on_download_timeout(peer, now_micros);
    if peer.is_disconnecting() {
        return;
    }

    broadcast_addresses(ctx, peer, now, now_micros);
    maybe_start_header_sync(ctx, peer, now);
    check_initial_headers_timeout(ctx, peer, now);
    request_initial_block_availability(ctx, peer, now);
    announce_blocks(ctx, peer);
    drain_inventory(ctx, peer, now);

    // Finally, keep the download pipeline full.
    let mut guard = ctx.main.lock();
    let main = &mut *guard;
    if let Some(state) = main.node_states.get_mut(peer.id) {
        ctx.requester
            .request_next_blocks(peer, &main.chain, state, now_micros);
    }
}

/// Keepalive / latency probe. Nonce is nonzero random; pre-nonce peers get
/// a bare ping and no pong bookkeeping.
fn maybe_send_ping(peer: &Arc<Peer>, now_micros: u64) {
    let mut info = peer.info.lock();
    let mut ping_send = info.ping_queued;
    if info.ping_nonce_sent == 0
        && info.ping_start_micros + PING_INTERVAL * 1_000_000 < now_micros
    {
        ping_send = true;
    }
    if !ping_send {
        return;
    }
    let mut nonce = 0u64;
    while nonce == 0 {
        nonce = rand::thread_rng().gen();
    }
    info.ping_queued = false;
    info.ping_start_micros = now_micros;
    if info.version > BIP0031_VERSION {
        info.ping_nonce_sent = nonce;
        drop(info);
        peer.push_message(Message::Ping(Some(nonce)));
    } else {
        info.ping_nonce_sent = 0;
        drop(info);
        peer.push_message(Message::Ping(None));
    }
}

/// Thin-class blocks stuck past six retry intervals mean a stalling peer;
/// disconnect it rather than waiting for data that may never come.
fn check_thin_download_timeouts(ctx: &NetContext, peer: &Arc<Peer>, now: u64) {
    if peer.whitelisted || ctx.params.network == crate::config::Network::Regtest {
        return;
    }
    let stalled = {
        let in_flight = peer.thin_in_flight.lock();
        in_flight
            .values()
            .any(|e| !e.received && now.saturating_sub(e.requested_at) > 6 * BLOCK_REQUEST_RETRY_INTERVAL / 1_000_000)
    };
    if stalled {
        warn!(peer = %peer.log_name(), "thin block download timeout exceeded, disconnecting");
        peer.set_disconnect();
    }
}

/// Address gossip: advertise our own address on a slow Poisson schedule,
/// and drain the relayed-address queue on a fast one, in wire-sized
/// batches.
fn broadcast_addresses(ctx: &NetContext, peer: &Arc<Peer>, now: u64, now_micros: u64) {
    // Own address, at most once a day on average, never during initial
    // sync.
    let advertise_local = {
        let mut info = peer.info.lock();
        if info.next_local_addr_send < now_micros {
            info.next_local_addr_send =
                poisson_next_send(now_micros, AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL);
            true
        } else {
            false
        }
    };
    if advertise_local && ctx.config.listen && !ctx.is_initial_block_download(now) {
        let local = *ctx.local_address.lock();
        if let Some(mut local) = local {
            local.time = now as u32;
            peer.push_address(&local);
        }
    }

    // Relayed addresses.
    let drain = {
        let mut info = peer.info.lock();
        if info.next_addr_send < now_micros {
            info.next_addr_send = poisson_next_send(now_micros, AVG_ADDRESS_BROADCAST_INTERVAL);
            true
        } else {
            false
        }
    };
    if !drain {
        return;
    }
    let batches: Vec<Vec<crate::network::protocol::NetAddress>> = peer.with_send_queue(|send| {
        let mut batches = Vec::new();
        let mut current = Vec::new();
        for addr in send.addr_to_send.drain(..) {
            if send.addr_known.contains(&addr.key()) {
                continue;
            }
            send.addr_known.insert(&addr.key());
            current.push(addr);
            if current.len() >= MAX_ADDR_TO_RELAY {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    });
    for batch in batches {
        peer.push_message(Message::Addr(batch));
    }
}

/// Start header sync with this peer when it looks like a useful source and
/// we are not already syncing from enough peers.
fn maybe_start_header_sync(ctx: &NetContext, peer: &Arc<Peer>, now: u64) {
    let mut guard = ctx.main.lock();
    let main = &mut *guard;
    let Some(state) = main.node_states.get_mut(peer.id) else {
        return;
    };
    if state.sync_started {
        return;
    }

    // Nice peers first; anyone if nobody nice is around.
    let mut fetch = state.preferred_download
        || (ctx.preferred_download.load(std::sync::atomic::Ordering::Acquire) == 0
            && !peer.one_shot);

    // Headers are downloaded from at most one pruned or light peer.
    let is_full_node = peer.info.lock().is_full_node();
    if !is_full_node
        && ctx
            .sync_started_pruned
            .load(std::sync::atomic::Ordering::Acquire)
            >= 1
    {
        fetch = false;
    }

    let tip_recent = main
        .chain
        .tip_entry()
        .map(|t| (t.header.time as u64) > now.saturating_sub(SINGLE_PEER_REQUEST_MODE_AGE))
        .unwrap_or(false);

    let sync_slots_free =
        ctx.sync_started.load(std::sync::atomic::Ordering::Acquire) < MAX_HEADER_REQS_DURING_IBD;
    if !((sync_slots_free && fetch) || tip_recent) {
        return;
    }

    let Some(tip) = main.chain.tip() else { return };
    // Start at the parent of the tip so an up-to-date peer still answers
    // with at least one header and we learn its best block.
    let start = main.chain.index.entry(tip).parent.unwrap_or(tip);
    let start_height = main.chain.index.entry(start).height;

    // Only sync from peers whose advertised chain is ahead of ours.
    if (start_height as i64) >= peer.info.lock().start_height as i64 {
        return;
    }

    state.sync_started = true;
    state.sync_start_time = now;
    state.requested_initial_block_availability = true;
    state.first_headers_expected_height = start_height;
    ctx.sync_started.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    if !is_full_node {
        ctx.sync_started_pruned
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    info!(
        peer = %peer.log_name(),
        height = start_height,
        "initial getheaders"
    );
    let locator = main.chain.locator(Some(start));
    peer.push_message(Message::GetHeaders {
        locator,
        hash_stop: Hash256::ZERO,
    });
}

/// A sync peer that never produced its first headers batch is either slow
/// or stalling us. The legacy behavior only logged; disconnecting is the
/// default here, behind a config switch.
fn check_initial_headers_timeout(ctx: &NetContext, peer: &Arc<Peer>, now: u64) {
    if peer.whitelisted {
        return;
    }
    let mut guard = ctx.main.lock();
    let Some(state) = guard.node_states.get_mut(peer.id) else {
        return;
    };
    if !state.sync_started
        || state.first_headers_received
        || state.sync_start_time >= now.saturating_sub(ctx.config.initial_headers_timeout)
    {
        return;
    }
    warn!(
        peer = %peer.log_name(),
        "initial headers not received before timeout"
    );
    if ctx.config.disconnect_on_header_timeout {
        peer.set_disconnect();
    } else {
        // Log-only mode: rearm so the warning does not repeat every tick.
        state.sync_start_time = now;
    }
}

/// During initial download, ask each full-node peer once whether it has our
/// best header, so its block availability is known before we pick download
/// sources.
fn request_initial_block_availability(ctx: &NetContext, peer: &Arc<Peer>, now: u64) {
    let mut guard = ctx.main.lock();
    let main = &mut *guard;
    if !main
        .chain
        .is_initial_block_download(now, ctx.params.max_tip_age)
    {
        return;
    }
    let Some(best_header) = main.chain.best_header else {
        return;
    };
    let Some(state) = main.node_states.get_mut(peer.id) else {
        return;
    };
    if state.requested_initial_block_availability || state.best_known_block.is_some() {
        return;
    }
    if !peer.info.lock().is_full_node() {
        return;
    }
    state.requested_initial_block_availability = true;
    let hash = main.chain.index.entry(best_header).hash;
    debug!(peer = %peer.log_name(), block = %hash, "requesting header for block availability");
    peer.push_message(Message::GetHeaders {
        locator: Default::default(),
        hash_stop: hash,
    });
}

/// Whether the peer is known to have this header, via its best-known block
/// or the last header we sent it.
fn peer_has_header(chain: &Chain, state: &NodeState, id: BlockId) -> bool {
    let height = chain.index.entry(id).height;
    if let Some(best) = state.best_known_block {
        if chain.index.ancestor(best, height) == Some(id) {
            return true;
        }
    }
    if let Some(sent) = state.best_header_sent {
        if chain.index.ancestor(sent, height) == Some(id) {
            return true;
        }
    }
    false
}

/// Announce recent blocks: as a contiguous headers message when the peer
/// prefers that and the hashes connect, otherwise as plain inv entries.
fn announce_blocks(ctx: &NetContext, peer: &Arc<Peer>) {
    let to_announce: Vec<Hash256> = {
        let mut inv_state = peer.inv_state.lock();
        if inv_state.blocks_to_announce.is_empty() {
            return;
        }
        std::mem::take(&mut inv_state.blocks_to_announce)
    };

    let mut guard = ctx.main.lock();
    let main = &mut *guard;
    let Some(state) = main.node_states.get_mut(peer.id) else {
        return;
    };
    ctx.requester.process_block_availability(&main.chain, state);

    let mut revert_to_inv =
        !state.prefer_headers || to_announce.len() > MAX_BLOCKS_TO_ANNOUNCE;
    let mut headers = Vec::new();
    let mut best_queued: Option<BlockId> = None;

    if !revert_to_inv {
        // Find the first header the peer lacks, then send everything past
        // it. Anything off the active chain or non-connecting reverts the
        // whole announcement to inv.
        let mut found_start = false;
        for hash in &to_announce {
            let Some(id) = main.chain.index.get(hash) else {
                continue;
            };
            if !main.chain.active.contains(&main.chain.index, id) {
                // Reorged away from this block mid-announcement.
                revert_to_inv = true;
                break;
            }
            let parent = main.chain.index.entry(id).parent;
            if let Some(prev_queued) = best_queued {
                if parent != Some(prev_queued) {
                    // Announced blocks that do not connect to each other.
                    revert_to_inv = true;
                    break;
                }
            }
            best_queued = Some(id);
            if found_start {
                headers.push(main.chain.index.entry(id).header);
            } else if peer_has_header(&main.chain, state, id) {
                continue;
            } else if parent.is_none()
                || peer_has_header(&main.chain, state, parent.unwrap())
            {
                found_start = true;
                headers.push(main.chain.index.entry(id).header);
            } else {
                // Peer has neither this header nor its parent; nothing
                // would connect.
                revert_to_inv = true;
                break;
            }
        }
    }

    if revert_to_inv {
        for hash in &to_announce {
            let Some(id) = main.chain.index.get(hash) else {
                continue;
            };
            if !main.chain.active.contains(&main.chain.index, id) {
                debug!(hash = %hash, "announcing block not on main chain");
            }
            if !peer_has_header(&main.chain, state, id) {
                peer.push_inventory(Inv::block(*hash));
                debug!(peer = %peer.log_name(), hash = %hash, "announcing via inv");
            }
        }
    } else if !headers.is_empty() {
        debug!(
            peer = %peer.log_name(),
            count = headers.len(),
            "announcing via headers"
        );
        peer.push_message(Message::Headers(headers));
        state.best_header_sent = best_queued;
    }
}

/// Trickle queued inventory in bounded slices. Transaction inv is withheld
/// from peers that never contribute traffic and from peers that already
/// know the hash; block inv always goes out.
fn drain_inventory(ctx: &NetContext, peer: &Arc<Peer>, now: u64) {
    let choke_tx = peer
        .activity_bytes
        .load(std::sync::atomic::Ordering::Acquire)
        == 0
        && now.saturating_sub(peer.connected_at) > INV_CHOKE_IDLE_SECONDS;

    loop {
        let slice: Vec<Inv> = {
            let mut inv_state = peer.inv_state.lock();
            if inv_state.to_send.is_empty() {
                break;
            }
            let take = inv_state.to_send.len().min(MAX_INV_TO_SEND);
            let mut slice = Vec::with_capacity(take);
            let drained: Vec<Inv> = inv_state.to_send.drain(..take).collect();
            for inv in drained {
                if inv.kind == InvKind::Tx {
                    if choke_tx {
                        continue;
                    }
                    if inv_state.known.contains(inv.hash.as_bytes()) {
                        continue;
                    }
                }
                inv_state.known.insert(inv.hash.as_bytes());
                slice.push(inv);
            }
            slice
        };
        if slice.is_empty() {
            continue;
        }
        peer.push_message(Message::Inv(
            slice
                .iter()
                .map(|inv| RawInv {
                    kind: inv.kind.to_u32(),
                    hash: inv.hash,
                })
                .collect(),
        ));
    }
}
