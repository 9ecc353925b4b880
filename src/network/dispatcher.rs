//! Inbound message dispatch.
//!
//! [`process_messages`] drains one peer's receive queue, applying the
//! envelope-level DoS gates (magic, header shape, checksum) before decoding
//! and dispatching each command. Handlers mutate shared state and queue
//! outbound messages; they never block on network I/O. A `false` return
//! from the outer loop drops the peer.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::bloom::BloomFilter;
use crate::network::dos::BanReason;
use crate::network::peer::{update_preferred_download, HandshakeState, Peer};
use crate::network::protocol::{self, commands, Block, BlockLocator, Hash256, Inv, InvKind, Message, NetAddress, RawInv, RejectMessage, Transaction, VersionMessage, BIP0031_VERSION, CADDR_TIME_VERSION, EXPEDITED_VERSION, MAX_ADDR_TO_RELAY, MAX_GETBLOCKS_RESULTS, MAX_HEADERS_RESULTS, MAX_INV_SZ, MAX_SCRIPT_ELEMENT_SIZE, MAX_SUBVERSION_LENGTH, MIN_PEER_PROTO_VERSION, NODE_BLOOM, NO_BLOOM_VERSION, PROTOCOL_VERSION, REJECT_DUPLICATE, REJECT_INVALID, REJECT_MALFORMED, REJECT_OBSOLETE, SENDCMPCT_VERSION, SENDHEADERS_VERSION, SMALLEST_MAX_BLOOM_FILTER_SIZE};
use crate::network::{header_sync, NetContext, TxSource};
use crate::utils::sanitize_string;

/// Seconds of age that make a served block "historical" for the outbound
/// bandwidth budget.
const HISTORICAL_BLOCK_AGE: u64 = 7 * 24 * 60 * 60;
/// Off-chain blocks older than this (in time or equivalent work) are never
/// served, defeating chain fingerprinting.
const STALE_BLOCK_WINDOW: u64 = 30 * 24 * 60 * 60;
/// Yield to other peers after this many messages in one pass.
const MAX_MESSAGES_PER_PASS: usize = 2000;
/// Thin-block getdata rate above which a mainnet peer is penalized.
const THIN_REQUEST_RATE_LIMIT: f64 = 20.0;

/// Build our version message for `peer`.
pub fn build_version(ctx: &NetContext, peer: &Peer, now: u64) -> VersionMessage {
    let start_height = {
        let main = ctx.main.lock();
        main.chain
            .tip_entry()
            .map(|t| t.height as i32)
            .unwrap_or(0)
    };
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: ctx.config.services,
        timestamp: now as i64,
        addr_recv: NetAddress::from_socket_addr(peer.addr, 0, 0),
        addr_from: NetAddress {
            time: 0,
            services: ctx.config.services,
            ip: [0u8; 16],
            port: ctx.config.listen_port,
        },
        nonce: ctx.local_nonce,
        user_agent: ctx.config.user_agent.clone(),
        start_height,
        relay: !ctx.config.blocks_only,
    }
}

/// Push our version to a freshly connected outbound peer and start the
/// verack timer.
pub fn send_version(ctx: &NetContext, peer: &Arc<Peer>, now: u64) {
    let version = build_version(ctx, peer, now);
    peer.info.lock().version_sent_at = Some(now);
    peer.push_message(Message::Version(version));
}

/// Drain and process this peer's receive queue. Returns false when the peer
/// must be dropped with a ban-worthy envelope violation.
pub fn process_messages(ctx: &NetContext, peer: &Arc<Peer>, cancel: &CancellationToken) -> bool {
    // Serve any getdata work deferred by the yield rule before reading more.
    if !peer.getdata_queue.lock().is_empty() {
        process_getdata(ctx, peer, crate::utils::current_timestamp(), cancel);
    }

    let mut ok = true;
    let mut processed = 0usize;

    while !peer.is_disconnecting() && peer.send_size() < ctx.config.send_buffer_size {
        if cancel.is_cancelled() {
            break;
        }
        let msg = {
            let mut recv = peer.recv.lock();
            match recv.queue.pop_front() {
                Some(m) => {
                    recv.size = recv.size.saturating_sub(m.size());
                    m
                }
                None => break,
            }
        };
        processed += 1;

        // Envelope gates. A wrong network magic is unanswerable garbage:
        // ban the address and stop reading.
        if msg.header.magic != ctx.params.magic() {
            warn!(peer = %peer.log_name(), "invalid message start, banning");
            if !peer.whitelisted {
                ctx.dos.ban(
                    peer.addr.ip(),
                    BanReason::InvalidEnvelope,
                    4 * 60 * 60,
                    msg.received_at / 1_000_000,
                );
            }
            peer.set_disconnect();
            ok = false;
            break;
        }
        if !msg.header.is_valid() {
            warn!(
                peer = %peer.log_name(),
                command = %sanitize_string(&msg.header.command_str()),
                "errors in message header"
            );
            continue;
        }
        if !msg.checksum_ok() {
            warn!(
                peer = %peer.log_name(),
                command = %sanitize_string(&msg.header.command_str()),
                "checksum error"
            );
            continue;
        }

        let command = msg.header.command_str();
        let decoded = match Message::decode(&command, &msg.payload) {
            Ok(m) => m,
            Err(e) => {
                info!(
                    peer = %peer.log_name(),
                    command = %sanitize_string(&command),
                    error = %e,
                    "failed to decode payload"
                );
                // A malformed reject must not trigger a reject reply;
                // anything else gets one.
                if command != commands::REJECT {
                    peer.push_message(Message::Reject(RejectMessage {
                        message: command.clone(),
                        code: REJECT_MALFORMED,
                        reason: "error parsing message".into(),
                        hash: None,
                    }));
                }
                continue;
            }
        };

        let wire_size = msg.size() as u64;
        let handled = handle_message(ctx, peer, decoded, msg.received_at, cancel);
        if !handled {
            info!(
                peer = %peer.log_name(),
                command = %sanitize_string(&command),
                "message handler failed"
            );
        } else if matches!(
            command.as_str(),
            commands::TX | commands::BLOCK | commands::HEADERS | commands::ADDR | commands::GETDATA
        ) {
            peer.activity_bytes
                .fetch_add(wire_size, std::sync::atomic::Ordering::AcqRel);
        }

        if processed > MAX_MESSAGES_PER_PASS {
            // Let someone else do something periodically.
            break;
        }
    }
    ok
}

/// Dispatch one decoded message. Returns handler success; a failing handler
/// logs but only drops the peer when it set the disconnect flag itself.
pub fn handle_message(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    msg: Message,
    received_at: u64,
    cancel: &CancellationToken,
) -> bool {
    let now_micros = received_at;
    let now = received_at / 1_000_000;
    let command = msg.command().to_string();
    debug!(peer = %peer.log_name(), command = %sanitize_string(&command), "received");

    // Nodes that never advertised bloom service drop the filter family
    // outright; modern peers sending it anyway are banned.
    if ctx.config.services & NODE_BLOOM == 0
        && matches!(
            msg,
            Message::FilterLoad(_) | Message::FilterAdd { .. } | Message::FilterClear
        )
    {
        let version = peer.info.lock().version;
        if version >= NO_BLOOM_VERSION {
            ctx.dos.misbehaving(peer, 100, now);
        } else {
            info!(peer = %peer.log_name(), "inconsistent bloom filter settings");
            peer.set_disconnect();
        }
        return false;
    }

    // Strict handshake ordering: nothing but version before the version
    // message. Whitelisted peers are tolerated with a log line.
    if !matches!(msg, Message::Version(_))
        && peer.info.lock().handshake == HandshakeState::New
    {
        if peer.whitelisted {
            debug!(
                peer = %peer.log_name(),
                command = %sanitize_string(&command),
                "message before version from whitelisted peer"
            );
        } else {
            warn!(
                peer = %peer.log_name(),
                command = %sanitize_string(&command),
                "message received before version, disconnecting"
            );
            peer.set_disconnect();
            return false;
        }
    }

    match msg {
        Message::Version(v) => handle_version(ctx, peer, v, now),
        Message::Verack => handle_verack(ctx, peer),
        Message::XVersion { listen_port } => handle_xversion(ctx, peer, listen_port, now),
        Message::XVerack => handle_xverack(ctx, peer, now),
        Message::Addr(addrs) => handle_addr(ctx, peer, addrs, now, cancel),
        Message::SendHeaders => {
            let mut main = ctx.main.lock();
            if let Some(state) = main.node_states.get_mut(peer.id) {
                state.prefer_headers = true;
            }
            true
        }
        Message::SendCmpct {
            high_bandwidth: _,
            version,
        } => {
            let mut info = peer.info.lock();
            if info.version >= SENDCMPCT_VERSION {
                info.supports_compact_blocks = version == 1;
            }
            true
        }
        Message::Inv(invs) => handle_inv(ctx, peer, invs, now, cancel),
        Message::GetData(invs) => handle_getdata(ctx, peer, invs, now, cancel),
        Message::GetBlocks { locator, hash_stop } => {
            handle_getblocks(ctx, peer, locator, hash_stop, cancel)
        }
        Message::GetHeaders { locator, hash_stop } => {
            handle_getheaders(ctx, peer, locator, hash_stop)
        }
        Message::Tx(tx) => handle_tx(ctx, peer, tx, now_micros),
        Message::Headers(headers) => header_sync::handle_headers(ctx, peer, headers, now),
        Message::Block(block) => handle_block(ctx, peer, block, now, now_micros),
        Message::GetAddr => handle_getaddr(ctx, peer),
        Message::Mempool => handle_mempool(ctx, peer, now),
        Message::Ping(nonce) => handle_ping(peer, nonce),
        Message::Pong(nonce) => handle_pong(peer, nonce, now_micros),
        Message::FilterLoad(filter) => handle_filterload(ctx, peer, filter, now),
        Message::FilterAdd { data } => handle_filteradd(ctx, peer, data, now),
        Message::FilterClear => {
            *peer.filter.lock() = Some(BloomFilter::empty());
            peer.info.lock().relay_txes = true;
            true
        }
        Message::FilterSizeXthin(size) => handle_filtersizexthin(peer, size),
        Message::Reject(reject) => handle_reject(ctx, peer, reject, now),
        Message::NotFound(invs) => {
            debug!(peer = %peer.log_name(), count = invs.len(), "notfound");
            true
        }
        Message::MerkleBlock { .. } => true,
        Message::Unknown { command } => {
            // Ignore unknown commands for extensibility.
            debug!(
                peer = %peer.log_name(),
                command = %sanitize_string(&command),
                "unknown command"
            );
            true
        }
    }
}

fn handle_version(ctx: &NetContext, peer: &Arc<Peer>, v: VersionMessage, now: u64) -> bool {
    {
        let info = peer.info.lock();
        if info.handshake != HandshakeState::New {
            drop(info);
            peer.push_message(Message::Reject(RejectMessage {
                message: commands::VERSION.into(),
                code: REJECT_DUPLICATE,
                reason: "Duplicate version message".into(),
                hash: None,
            }));
            peer.set_disconnect();
            warn!(peer = %peer.log_name(), "duplicate version message, disconnecting");
            return false;
        }
    }

    if v.version < MIN_PEER_PROTO_VERSION {
        peer.push_message(Message::Reject(RejectMessage {
            message: commands::VERSION.into(),
            code: REJECT_OBSOLETE,
            reason: format!("Protocol Version must be {} or greater", MIN_PEER_PROTO_VERSION),
            hash: None,
        }));
        ctx.dos.misbehaving(peer, 100, now);
        warn!(
            peer = %peer.log_name(),
            version = v.version,
            "obsolete protocol version, banning"
        );
        return false;
    }

    // Connected to ourself: drop silently, no reply beyond anything already
    // pushed.
    if v.nonce == ctx.local_nonce && v.nonce > 1 {
        info!(peer = %peer.log_name(), "connected to self, disconnecting");
        peer.set_disconnect();
        return true;
    }

    let mut user_agent = sanitize_string(&v.user_agent);
    user_agent.truncate(MAX_SUBVERSION_LENGTH);
    {
        let mut info = peer.info.lock();
        info.handshake = HandshakeState::VersionReceived;
        info.version = v.version;
        info.services = v.services;
        info.user_agent = user_agent;
        info.start_height = v.start_height;
        info.relay_txes = v.relay;
        info.time_offset = v.timestamp.saturating_sub(now as i64);
    }

    // Be shy and don't send version until we hear one.
    if peer.inbound {
        send_version(ctx, peer, now);
    }

    {
        let mut main = ctx.main.lock();
        if let Some(state) = main.node_states.get_mut(peer.id) {
            update_preferred_download(peer, state, &ctx.preferred_download);
        }
    }

    peer.info.lock().verack_sent = true;
    peer.push_message(Message::Verack);

    // The peer's view of our address seeds our own advertising.
    if v.addr_recv.is_routable() {
        let mut local = v.addr_recv;
        local.services = ctx.config.services;
        local.port = ctx.config.listen_port;
        *ctx.local_address.lock() = Some(local);
    }

    if !peer.inbound {
        if ctx.config.listen && !ctx.is_initial_block_download(now) && v.addr_recv.is_routable() {
            let mut local = v.addr_recv;
            local.services = ctx.config.services;
            local.time = now as u32;
            peer.push_address(&local);
        }

        // Solicit addresses while our book is thin.
        if peer.one_shot || ctx.externals.addrbook.len() < 1000 {
            peer.push_message(Message::GetAddr);
            peer.info.lock().getaddr_in_flight = true;
        }
        ctx.externals.addrbook.good(peer.addr);
    } else if v.addr_from.is_routable() {
        ctx.externals
            .addrbook
            .add(&[v.addr_from], peer.addr, 2 * 60 * 60);
    }

    info!(
        peer = %peer.log_name(),
        version = v.version,
        blocks = v.start_height,
        agent = %peer.info.lock().user_agent,
        "received version"
    );

    // Feelers only verify liveness; hang up after the exchange.
    if peer.feeler {
        debug!(peer = %peer.log_name(), "disconnecting feeler");
        peer.set_disconnect();
    }
    true
}

fn handle_verack(ctx: &NetContext, peer: &Arc<Peer>) -> bool {
    {
        let info = peer.info.lock();
        if info.version_sent_at.is_none() {
            drop(info);
            warn!(peer = %peer.log_name(), "verack before we sent version, disconnecting");
            peer.set_disconnect();
            return false;
        }
        if peer.is_connected() {
            drop(info);
            warn!(peer = %peer.log_name(), "duplicate verack, disconnecting");
            peer.set_disconnect();
            return false;
        }
    }

    peer.mark_connected();
    let (version, thin_capable) = {
        let mut info = peer.info.lock();
        info.handshake = HandshakeState::Connected;
        (info.version, info.thin_block_capable())
    };

    // Prefer headers announcements from peers that can send them.
    if version >= SENDHEADERS_VERSION {
        peer.push_message(Message::SendHeaders);
    }
    // Advertise the biggest thin-block bloom filter we accept.
    if thin_capable {
        peer.push_message(Message::FilterSizeXthin(SMALLEST_MAX_BLOOM_FILTER_SIZE));
    }
    // Extension handshake carries our listening port for expedited relay.
    if version >= EXPEDITED_VERSION {
        peer.info.lock().xversion_sent = true;
        peer.push_message(Message::XVersion {
            listen_port: ctx.config.listen_port,
        });
    }
    true
}

fn handle_xversion(ctx: &NetContext, peer: &Arc<Peer>, listen_port: u16, now: u64) -> bool {
    let mut info = peer.info.lock();
    if !info.verack_sent {
        drop(info);
        ctx.dos.misbehaving(peer, 100, now);
        warn!(peer = %peer.log_name(), "xversion before verack");
        return false;
    }
    if info.xversion_port.is_some() {
        drop(info);
        peer.push_message(Message::Reject(RejectMessage {
            message: commands::XVERSION.into(),
            code: REJECT_DUPLICATE,
            reason: "Duplicate xversion message".into(),
            hash: None,
        }));
        ctx.dos.misbehaving(peer, 100, now);
        return false;
    }
    info.xversion_port = Some(listen_port);
    drop(info);
    peer.push_message(Message::XVerack);
    true
}

fn handle_xverack(ctx: &NetContext, peer: &Arc<Peer>, now: u64) -> bool {
    if !peer.info.lock().xversion_sent {
        ctx.dos.misbehaving(peer, 100, now);
        warn!(peer = %peer.log_name(), "xverack before we sent xversion");
        return false;
    }
    // Expedited forwarding setup proceeds outside the core.
    true
}

fn handle_addr(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    mut addrs: Vec<NetAddress>,
    now: u64,
    cancel: &CancellationToken,
) -> bool {
    if addrs.len() > MAX_ADDR_TO_RELAY {
        ctx.dos.misbehaving(peer, 20, now);
        warn!(peer = %peer.log_name(), count = addrs.len(), "oversized addr message");
        return false;
    }
    // Old peers without addr timestamps are only interesting while seeding.
    {
        let info = peer.info.lock();
        if info.version < CADDR_TIME_VERSION && ctx.externals.addrbook.len() > 1000 {
            return true;
        }
    }

    let batch = addrs.len();
    let since = now.saturating_sub(10 * 60);
    let solicited = peer.info.lock().getaddr_in_flight;
    let mut keep = Vec::new();

    for addr in addrs.iter_mut() {
        if cancel.is_cancelled() {
            break;
        }
        // Clamp absurd timestamps to a stale-but-plausible value.
        let t = addr.time as u64;
        if t <= 100_000_000 || t > now + 10 * 60 {
            addr.time = now.saturating_sub(5 * 24 * 60 * 60) as u32;
        }
        peer.with_send_queue(|send| send.addr_known.insert(&addr.key()));

        let reachable = ctx.config.is_reachable(addr);
        if (addr.time as u64) > since && !solicited && batch <= 10 && addr.is_routable() {
            relay_address(ctx, peer, addr, reachable, now);
        }
        // Do not store addresses outside our networks.
        if reachable {
            keep.push(*addr);
        }
    }

    ctx.externals.addrbook.add(&keep, peer.addr, 2 * 60 * 60);
    if batch < MAX_ADDR_TO_RELAY {
        peer.info.lock().getaddr_in_flight = false;
    }
    if peer.one_shot {
        debug!(peer = %peer.log_name(), "disconnecting one-shot after addr");
        peer.set_disconnect();
    }
    true
}

/// Relay a fresh routable address to a small deterministic subset of peers.
/// The salt rotates daily so the same nodes are chosen for 24 hours and
/// their known-address filters suppress repeats.
fn relay_address(ctx: &NetContext, from: &Peer, addr: &NetAddress, reachable: bool, now: u64) {
    let day = now / (24 * 60 * 60);
    let mut seed = Vec::with_capacity(34);
    seed.extend_from_slice(&ctx.addr_relay_salt.to_le_bytes());
    seed.extend_from_slice(&addr.key());
    seed.extend_from_slice(&day.to_le_bytes());
    let base = protocol::double_sha256(&seed);

    let mut ranked: Vec<(Hash256, Arc<Peer>)> = ctx
        .peer_snapshot()
        .into_iter()
        .filter(|p| p.id != from.id && !p.is_disconnecting())
        .filter(|p| p.info.lock().version >= CADDR_TIME_VERSION)
        .map(|p| {
            let mut key = Vec::with_capacity(40);
            key.extend_from_slice(base.as_bytes());
            key.extend_from_slice(&p.id.to_le_bytes());
            (protocol::double_sha256(&key), p)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));

    // Addresses on networks we cannot reach travel to fewer peers.
    let fanout = if reachable { 2 } else { 1 };
    for (_, target) in ranked.into_iter().take(fanout) {
        target.push_address(addr);
    }
}

fn handle_inv(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    invs: Vec<RawInv>,
    now: u64,
    cancel: &CancellationToken,
) -> bool {
    if invs.len() > MAX_INV_SZ || invs.is_empty() {
        ctx.dos.misbehaving(peer, 20, now);
        warn!(peer = %peer.log_name(), count = invs.len(), "bad inv size");
        return false;
    }

    let blocks_only = ctx.config.blocks_only && !(peer.whitelisted && ctx.config.whitelist_relay);

    for raw in &invs {
        if cancel.is_cancelled() {
            break;
        }
        let Some(inv) = raw.known() else {
            ctx.dos.misbehaving(peer, 20, now);
            warn!(peer = %peer.log_name(), kind = raw.kind, "invalid inv type");
            return false;
        };
        // inv announcements only ever carry plain tx/block entries.
        if inv.hash.is_zero() || inv.kind.is_block_class() && inv.kind != InvKind::Block {
            ctx.dos.misbehaving(peer, 20, now);
            return false;
        }

        match inv.kind {
            InvKind::Block => {
                let mut guard = ctx.main.lock();
                let main = &mut *guard;
                let already_have = main
                    .chain
                    .index
                    .get(&inv.hash)
                    .map(|id| main.chain.index.entry(id).has_data())
                    .unwrap_or(false);
                debug!(
                    peer = %peer.log_name(),
                    hash = %inv.hash,
                    have = already_have,
                    "got block inv"
                );
                if let Some(state) = main.node_states.get_mut(peer.id) {
                    ctx.requester
                        .update_block_availability(&main.chain, state, inv.hash);
                }
                let ibd = main
                    .chain
                    .is_initial_block_download(now, ctx.params.max_tip_age);
                if !already_have && !ibd {
                    // Learn the connecting header chain instead of trusting
                    // the announcement with a direct block request.
                    let locator = main.chain.locator(main.chain.best_header);
                    peer.push_message(Message::GetHeaders {
                        locator,
                        hash_stop: inv.hash,
                    });
                }
            }
            _ => {
                peer.mark_inventory_known(&inv);
                if blocks_only {
                    debug!(
                        peer = %peer.log_name(),
                        txid = %inv.hash,
                        "tx inv in violation of blocks-only"
                    );
                } else if !ctx.already_have_tx(&inv.hash, now) && !ctx.is_initial_block_download(now)
                {
                    ctx.requester
                        .ask_for_tx(inv.hash, peer.id, now * 1_000_000);
                }
            }
        }

        // An inv flood that outruns the send buffer twice over is abuse.
        if peer.send_size() > ctx.config.send_buffer_size * 2 {
            ctx.dos.misbehaving(peer, 50, now);
            warn!(peer = %peer.log_name(), "send buffer overflow during inv");
            return false;
        }
    }
    true
}

fn handle_getdata(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    invs: Vec<RawInv>,
    now: u64,
    cancel: &CancellationToken,
) -> bool {
    if invs.len() > MAX_INV_SZ || invs.is_empty() {
        ctx.dos.misbehaving(peer, 20, now);
        warn!(peer = %peer.log_name(), count = invs.len(), "bad getdata size");
        return false;
    }

    let mut typed = Vec::with_capacity(invs.len());
    for raw in &invs {
        let Some(inv) = raw.known() else {
            ctx.dos.misbehaving(peer, 20, now);
            warn!(peer = %peer.log_name(), kind = raw.kind, "invalid getdata type");
            return false;
        };
        if inv.kind == InvKind::ThinBlock && !thin_block_checks(ctx, peer, now) {
            return false;
        }
        typed.push(inv);
    }

    debug!(peer = %peer.log_name(), count = typed.len(), "received getdata");
    peer.getdata_queue.lock().extend(typed);
    process_getdata(ctx, peer, now, cancel);
    true
}

/// Anti-abuse gates for thin-block requests: capability plus a decaying
/// request rate.
fn thin_block_checks(ctx: &NetContext, peer: &Arc<Peer>, now: u64) -> bool {
    if !peer.info.lock().thin_block_capable() {
        ctx.dos.misbehaving(peer, 100, now);
        warn!(peer = %peer.log_name(), "thin block request from incapable peer");
        return false;
    }
    if ctx.params.network != crate::config::Network::Regtest {
        let rate = peer.info.lock().thin_request_rate.bump(now);
        debug!(peer = %peer.log_name(), rate, "thin request rate");
        if ctx.params.network == crate::config::Network::Main && rate >= THIN_REQUEST_RATE_LIMIT {
            ctx.dos.misbehaving(peer, 50, now);
            warn!(peer = %peer.log_name(), rate, "too many thin block requests");
            return false;
        }
    }
    true
}

/// Serve queued getdata entries. Yields after each block-class item so
/// other messages can interleave; stops early on backpressure.
pub fn process_getdata(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    now: u64,
    cancel: &CancellationToken,
) -> bool {
    let mut worked = false;
    let mut not_found = Vec::new();

    loop {
        if peer.send_size() >= ctx.config.send_buffer_size {
            break;
        }
        if cancel.is_cancelled() {
            break;
        }
        let inv = match peer.getdata_queue.lock().pop_front() {
            Some(inv) => inv,
            None => break,
        };
        worked = true;

        if inv.kind.is_block_class() {
            serve_block(ctx, peer, &inv, now);
            // High-priority item done; let other traffic interleave before
            // the next block leaves.
            break;
        } else {
            if !serve_tx(ctx, peer, &inv.hash, now) {
                not_found.push(inv);
            }
        }
    }

    if !not_found.is_empty() {
        peer.push_message(Message::NotFound(not_found));
    }
    worked
}

fn serve_tx(ctx: &NetContext, peer: &Arc<Peer>, txid: &Hash256, now: u64) -> bool {
    let tx = ctx
        .relay
        .get(txid, now)
        .or_else(|| ctx.externals.mempool.get(txid));
    match tx {
        Some(tx) => {
            peer.info.lock().txs_sent += 1;
            peer.push_message(Message::Tx(tx));
            true
        }
        None => false,
    }
}

fn serve_block(ctx: &NetContext, peer: &Arc<Peer>, inv: &Inv, now: u64) {
    let mut send = false;
    let mut have_data = false;
    {
        let main = ctx.main.lock();
        if let Some(id) = main.chain.index.get(&inv.hash) {
            let entry = main.chain.index.entry(id);
            have_data = entry.has_data();
            if main.chain.active.contains(&main.chain.index, id) {
                send = true;
            } else {
                // Off-chain blocks are served only when validated and
                // recent, both by time and by equivalent work, and never
                // when marked excessive.
                let best_time = main
                    .chain
                    .best_header
                    .map(|b| main.chain.index.entry(b).header.time as u64)
                    .unwrap_or(0);
                send = entry.scripts_valid()
                    && main.chain.best_header.is_some()
                    && best_time.saturating_sub(entry.header.time as u64) < STALE_BLOCK_WINDOW
                    && main.chain.proof_equivalent_seconds(id, ctx.params.pow_target_spacing)
                        < STALE_BLOCK_WINDOW;
                if !send {
                    info!(
                        peer = %peer.log_name(),
                        hash = %inv.hash,
                        "ignoring request for old block not on the main chain"
                    );
                } else if entry.is_excessive() {
                    send = false;
                    info!(
                        peer = %peer.log_name(),
                        hash = %inv.hash,
                        "ignoring request for excessive off-chain block"
                    );
                }
            }

            // The serving budget protects us from archival leeching:
            // historical and filtered requests disconnect over-budget
            // peers.
            if send && ctx.outbound.target_reached(now) && !peer.whitelisted {
                let best_time = main
                    .chain
                    .best_header
                    .map(|b| main.chain.index.entry(b).header.time as u64)
                    .unwrap_or(0);
                let historical =
                    best_time.saturating_sub(entry.header.time as u64) > HISTORICAL_BLOCK_AGE;
                if historical || inv.kind == InvKind::FilteredBlock {
                    info!(
                        peer = %peer.log_name(),
                        "historical block serving limit reached, disconnecting"
                    );
                    peer.set_disconnect();
                    send = false;
                }
            }
        }
    }

    if !send || !have_data {
        return;
    }
    // Pruned nodes may know the block but no longer store it.
    let Some(block) = ctx.externals.store.read_block(&inv.hash) else {
        debug!(hash = %inv.hash, "unable to load block from disk");
        return;
    };

    match inv.kind {
        InvKind::Block => {
            peer.info.lock().blocks_sent += 1;
            let msg = Message::Block(block);
            ctx.outbound.record(msg.wire_size() as u64, now);
            peer.push_message(msg);
        }
        InvKind::ThinBlock => match &ctx.externals.thin {
            Some(thin) => thin.send_thin_block(&block, peer),
            None => {
                peer.info.lock().blocks_sent += 1;
                let msg = Message::Block(block);
                ctx.outbound.record(msg.wire_size() as u64, now);
                peer.push_message(msg);
            }
        },
        InvKind::FilteredBlock => {
            let matched: Vec<Transaction> = {
                let mut filter = peer.filter.lock();
                match filter.as_mut() {
                    Some(f) => block
                        .txs
                        .iter()
                        .filter(|tx| f.is_relevant_and_update(tx))
                        .cloned()
                        .collect(),
                    // No filter loaded: no response at all.
                    None => return,
                }
            };
            let total = block.txs.len() as u32;
            let hashes = matched.iter().map(|tx| tx.txid()).collect();
            peer.info.lock().blocks_sent += 1;
            peer.push_message(Message::MerkleBlock {
                header: block.header,
                total_txs: total,
                matched: hashes,
                flags: Vec::new(),
            });
            // Push the matched transactions right behind so the SPV client
            // needs no extra round trip.
            for tx in matched {
                peer.info.lock().txs_sent += 1;
                peer.push_message(Message::Tx(tx));
            }
        }
        InvKind::Tx => unreachable!("block-class only"),
    }

    // Serving the continuation marker triggers the peer's next getblocks.
    let continued = {
        let mut inv_state = peer.inv_state.lock();
        if inv_state.hash_continue == Some(inv.hash) {
            inv_state.hash_continue = None;
            true
        } else {
            false
        }
    };
    if continued {
        let tip = ctx
            .main
            .lock()
            .chain
            .tip_entry()
            .map(|t| t.hash);
        if let Some(tip_hash) = tip {
            peer.push_message(Message::Inv(vec![RawInv {
                kind: InvKind::Block.to_u32(),
                hash: tip_hash,
            }]));
        }
    }
}

fn handle_getblocks(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    locator: BlockLocator,
    hash_stop: Hash256,
    cancel: &CancellationToken,
) -> bool {
    let main = ctx.main.lock();
    let chain = &main.chain;
    let fork = chain.find_fork(&locator);
    let mut cursor = fork.and_then(|id| chain.active.next(&chain.index, id));

    let tip_height = chain.tip_entry().map(|t| t.height).unwrap_or(0);
    // If pruning, stop before blocks we may not still have by the time the
    // peer asks for them.
    let pruned_blocks_likely_kept = ctx
        .params
        .min_blocks_to_keep
        .saturating_sub(3600 / ctx.params.pow_target_spacing.max(1));

    let mut limit = MAX_GETBLOCKS_RESULTS;
    debug!(
        peer = %peer.log_name(),
        from_height = cursor.map(|c| chain.index.entry(c).height).unwrap_or(0),
        "getblocks"
    );
    while let Some(id) = cursor {
        if cancel.is_cancelled() {
            break;
        }
        let entry = chain.index.entry(id);
        if entry.hash == hash_stop {
            break;
        }
        if ctx.config.prune_mode
            && (!entry.has_data() || entry.height + pruned_blocks_likely_kept <= tip_height)
        {
            debug!(height = entry.height, "getblocks stopping at pruned range");
            break;
        }
        peer.push_inventory(Inv::block(entry.hash));
        limit -= 1;
        if limit == 0 {
            // When this block is requested we will inv the tip, triggering
            // the peer's next batch.
            debug!(height = entry.height, "getblocks stopping at limit");
            peer.inv_state.lock().hash_continue = Some(entry.hash);
            break;
        }
        cursor = chain.active.next(&chain.index, id);
    }
    true
}

fn handle_getheaders(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    locator: BlockLocator,
    hash_stop: Hash256,
) -> bool {
    let mut guard = ctx.main.lock();
    let main = &mut *guard;
    let chain = &main.chain;

    let start = if locator.is_null() {
        // A null locator asks for the single stop header.
        match chain.index.get(&hash_stop) {
            Some(id) => Some(id),
            None => return true,
        }
    } else {
        chain
            .find_fork(&locator)
            .and_then(|id| chain.active.next(&chain.index, id))
    };

    let mut headers = Vec::new();
    let mut cursor = start;
    let mut last_sent = None;
    while let Some(id) = cursor {
        let entry = chain.index.entry(id);
        headers.push(entry.header);
        last_sent = Some(id);
        if headers.len() >= MAX_HEADERS_RESULTS || entry.hash == hash_stop {
            break;
        }
        cursor = chain.active.next(&chain.index, id);
    }

    // Either we walked to our tip or the peer already has it; remember the
    // newest header this peer got from us.
    if let Some(state) = main.node_states.get_mut(peer.id) {
        state.best_header_sent = last_sent.or_else(|| chain.tip());
    }
    debug!(peer = %peer.log_name(), count = headers.len(), "serving getheaders");
    peer.push_message(Message::Headers(headers));
    true
}

fn handle_tx(ctx: &NetContext, peer: &Arc<Peer>, tx: Transaction, now_micros: u64) -> bool {
    if ctx.config.blocks_only && !(peer.whitelisted && ctx.config.whitelist_relay) {
        debug!(peer = %peer.log_name(), "transaction sent in violation of blocks-only");
        return true;
    }

    let txid = tx.txid();
    let inv = Inv::tx(txid);

    // The tx is in the admission pipeline now, not yet in the mempool.
    ctx.requester.processing(&txid, peer.id);
    ctx.externals.admission.enqueue(
        tx,
        TxSource {
            peer: peer.id,
            peer_name: peer.log_name(),
            whitelisted: peer.whitelisted,
        },
    );
    peer.mark_inventory_known(&inv);
    ctx.requester
        .update_txn_response_time(&txid, peer.id, now_micros);
    true
}

fn handle_block(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    block: Block,
    now: u64,
    now_micros: u64,
) -> bool {
    let hash = block.hash();
    debug!(peer = %peer.log_name(), hash = %hash, "received block");

    // Near the tip, push the block out the expedited channel before
    // validation has finished.
    let near_tip = {
        let main = ctx.main.lock();
        main.chain.can_direct_fetch(now, ctx.params.pow_target_spacing)
    };
    if near_tip {
        ctx.externals.processor.forward_expedited(&block, peer.id);
    }

    ctx.requester.block_received(&hash);
    peer.mark_thin_block_received(&hash);
    {
        let mut main = ctx.main.lock();
        main.block_source.insert(hash, peer.id);
        if let Some(state) = main.node_states.get_mut(peer.id) {
            // A block can consume all bandwidth; restart the sync clock.
            state.sync_start_time = now;
        }
    }
    // Same reasoning for the ping clock.
    peer.info.lock().ping_start_micros = now_micros;

    ctx.externals.processor.process_new_block(block, peer.id);
    true
}

fn handle_getaddr(ctx: &NetContext, peer: &Arc<Peer>) -> bool {
    // Outbound connections don't get our address book: an attacker could
    // stuff addresses and read them back to fingerprint us.
    if !peer.inbound {
        debug!(peer = %peer.log_name(), "ignoring getaddr from outbound connection");
        return true;
    }
    {
        let mut info = peer.info.lock();
        if info.sent_addr_reply {
            debug!(peer = %peer.log_name(), "ignoring repeated getaddr");
            return true;
        }
        info.sent_addr_reply = true;
    }
    peer.with_send_queue(|send| send.addr_to_send.clear());
    for addr in ctx.externals.addrbook.addresses() {
        peer.push_address(&addr);
    }
    true
}

fn handle_mempool(ctx: &NetContext, peer: &Arc<Peer>, now: u64) -> bool {
    if ctx.outbound.target_reached(now) && !peer.whitelisted {
        info!(
            peer = %peer.log_name(),
            "mempool request with bandwidth limit reached, disconnecting"
        );
        peer.set_disconnect();
        return true;
    }

    let hashes = ctx.externals.mempool.query_hashes();
    let have_filter = peer.filter.lock().is_some();

    let mut invs: Vec<RawInv> = Vec::new();
    for hash in hashes {
        if have_filter {
            let Some(tx) = ctx.externals.mempool.get(&hash) else {
                continue;
            };
            let relevant = peer
                .filter
                .lock()
                .as_mut()
                .map(|f| f.is_relevant_and_update(&tx))
                .unwrap_or(true);
            if !relevant {
                continue;
            }
        }
        invs.push(RawInv {
            kind: InvKind::Tx.to_u32(),
            hash,
        });
        if invs.len() == MAX_INV_SZ {
            peer.push_message(Message::Inv(std::mem::take(&mut invs)));
        }
    }
    if !invs.is_empty() {
        peer.push_message(Message::Inv(invs));
    }
    true
}

fn handle_ping(peer: &Arc<Peer>, nonce: Option<u64>) -> bool {
    if peer.info.lock().version <= BIP0031_VERSION {
        // Pre-nonce peers get no pong at all.
        return true;
    }
    let Some(nonce) = nonce else {
        debug!(peer = %peer.log_name(), "ping without nonce from modern peer");
        return true;
    };
    // Exclusive serialization keeps the pong contiguous with its nonce even
    // while other workers queue traffic for this peer.
    let _exclusive = peer.msg_serializer.write();
    peer.push_message(Message::Pong(Some(nonce)));
    true
}

fn handle_pong(peer: &Arc<Peer>, nonce: Option<u64>, now_micros: u64) -> bool {
    let mut finished = false;
    let mut problem: Option<&'static str> = None;

    let mut info = peer.info.lock();
    match nonce {
        Some(nonce) => {
            if info.ping_nonce_sent != 0 {
                if nonce == info.ping_nonce_sent {
                    finished = true;
                    let rtt = now_micros.saturating_sub(info.ping_start_micros);
                    if rtt > 0 {
                        info.last_ping_micros = Some(rtt);
                        info.min_ping_micros =
                            Some(info.min_ping_micros.map_or(rtt, |m| m.min(rtt)));
                    } else {
                        problem = Some("Timing mishap");
                    }
                } else {
                    // Overlapping pings produce mismatches routinely.
                    problem = Some("Nonce mismatch");
                    if nonce == 0 {
                        // Buggy remote implementation; cancel this ping.
                        finished = true;
                        problem = Some("Nonce zero");
                    }
                }
            } else {
                problem = Some("Unsolicited pong without ping");
            }
        }
        None => {
            finished = true;
            problem = Some("Short payload");
        }
    }

    if let Some(problem) = problem {
        debug!(
            peer = %peer.log_name(),
            expected = info.ping_nonce_sent,
            problem,
            "pong"
        );
    }
    if finished {
        info.ping_nonce_sent = 0;
    }
    true
}

fn handle_filterload(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    msg: protocol::FilterLoadMessage,
    now: u64,
) -> bool {
    let filter = BloomFilter::from_message(msg);
    if !filter.is_within_size_constraints() {
        // There is no excuse for sending a too-large filter.
        ctx.dos.misbehaving(peer, 100, now);
        return false;
    }
    *peer.filter.lock() = Some(filter);
    peer.info.lock().relay_txes = true;
    true
}

fn handle_filteradd(ctx: &NetContext, peer: &Arc<Peer>, data: Vec<u8>, now: u64) -> bool {
    // No data element can ever exceed the script element cap, so neither
    // may a filter addition.
    if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
        ctx.dos.misbehaving(peer, 100, now);
        return false;
    }
    let mut filter = peer.filter.lock();
    match filter.as_mut() {
        Some(f) => {
            f.insert(&data);
            true
        }
        None => {
            drop(filter);
            ctx.dos.misbehaving(peer, 100, now);
            false
        }
    }
}

fn handle_filtersizexthin(peer: &Arc<Peer>, size: u32) -> bool {
    let mut info = peer.info.lock();
    if !info.thin_block_capable() {
        drop(info);
        peer.set_disconnect();
        return false;
    }
    if size < SMALLEST_MAX_BLOOM_FILTER_SIZE {
        drop(info);
        peer.push_message(Message::Reject(RejectMessage {
            message: commands::FILTERSIZEXTHIN.into(),
            code: REJECT_INVALID,
            reason: "filter size was too small".into(),
            hash: None,
        }));
        info!(peer = %peer.log_name(), size, "thin bloom filter size too small, disconnecting");
        peer.set_disconnect();
        return false;
    }
    info.thin_bloom_size = Some(size);
    true
}

fn handle_reject(ctx: &NetContext, peer: &Arc<Peer>, reject: RejectMessage, now: u64) -> bool {
    // Never answer a reject; that way lies a feedback loop.
    let kind = match reject.message.as_str() {
        commands::BLOCK => Some(InvKind::Block),
        commands::TX => Some(InvKind::Tx),
        _ => None,
    };
    info!(
        peer = %peer.log_name(),
        message = %sanitize_string(&reject.message),
        code = reject.code,
        reason = %sanitize_string(&reject.reason),
        "reject received"
    );
    if let (Some(kind), Some(hash)) = (kind, reject.hash) {
        let rejects = ctx.requester.rejected(&Inv { kind, hash }, peer.id);
        if rejects > 20 {
            // A peer that rejects everything we ask of it is useless at
            // best.
            ctx.dos.misbehaving(peer, 5, now);
        }
    }
    true
}
