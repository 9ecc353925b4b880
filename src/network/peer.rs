//! Per-peer protocol state.
//!
//! [`Peer`] carries the connection-scoped state: handshake progress, send
//! and receive buffers, inventory bookkeeping, the optional SPV bloom
//! filter, and timers. Sync-progress state that must be read alongside the
//! block index ([`NodeState`]) lives in [`NodeStateMap`] under the chain
//! lock instead.
//!
//! Lock order within a peer mirrors the global discipline: inventory, then
//! filter, then send buffer. Never take them in reverse.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::chain::BlockId;
use crate::network::bloom::{BloomFilter, RollingBloomFilter};
use crate::network::protocol::{Hash256, Inv, InvKind, Message, NetAddress, NetMessage, NODE_NETWORK, NODE_XTHIN};

/// Stable peer identifier, unique for the process lifetime.
pub type PeerId = u64;

/// Known-inventory filter capacity per generation.
const KNOWN_INV_CAPACITY: usize = 50_000;
/// Known-address filter capacity per generation.
const KNOWN_ADDR_CAPACITY: usize = 5_000;

/// Exponential decay time constant for the thin-block request counter,
/// seconds. Roughly a ten minute memory.
const THIN_REQUEST_DECAY_SECONDS: f64 = 600.0;

/// Handshake progression. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    New,
    VersionReceived,
    Connected,
}

/// Handshake fields, capability flags and timers. Guarded by the peer's
/// `info` mutex; everything here is peer-local.
#[derive(Debug)]
pub struct PeerInfo {
    pub handshake: HandshakeState,
    pub version: i32,
    pub services: u64,
    /// Sanitized, length-capped user agent.
    pub user_agent: String,
    pub start_height: i32,
    pub relay_txes: bool,
    pub time_offset: i64,
    /// When we pushed our version message (seconds); drives verack timeout.
    pub version_sent_at: Option<u64>,
    pub verack_sent: bool,
    /// Extension handshake: whether we sent our xversion, and the peer's
    /// advertised listening port once theirs arrived.
    pub xversion_sent: bool,
    pub xversion_port: Option<u16>,
    /// We replied to a getaddr already (one reply per connection).
    pub sent_addr_reply: bool,
    /// We asked this peer for addresses and await the reply.
    pub getaddr_in_flight: bool,
    pub supports_compact_blocks: bool,
    /// Peer's advertised maximum thin-block bloom size.
    pub thin_bloom_size: Option<u32>,

    pub ping_nonce_sent: u64,
    pub ping_start_micros: u64,
    pub ping_queued: bool,
    pub min_ping_micros: Option<u64>,
    pub last_ping_micros: Option<u64>,

    /// Next scheduled relayed-addr drain (micros).
    pub next_addr_send: u64,
    /// Next scheduled own-address broadcast (micros).
    pub next_local_addr_send: u64,

    /// Decaying rate counter for thin-block getdata requests.
    pub thin_request_rate: DecayCounter,

    pub blocks_sent: u64,
    pub txs_sent: u64,
}

impl Default for PeerInfo {
    fn default() -> Self {
        Self {
            handshake: HandshakeState::New,
            version: 0,
            services: 0,
            user_agent: String::new(),
            start_height: 0,
            relay_txes: true,
            time_offset: 0,
            version_sent_at: None,
            verack_sent: false,
            xversion_sent: false,
            xversion_port: None,
            sent_addr_reply: false,
            getaddr_in_flight: false,
            supports_compact_blocks: false,
            thin_bloom_size: None,
            ping_nonce_sent: 0,
            ping_start_micros: 0,
            ping_queued: false,
            min_ping_micros: None,
            last_ping_micros: None,
            next_addr_send: 0,
            next_local_addr_send: 0,
            thin_request_rate: DecayCounter::new(),
            blocks_sent: 0,
            txs_sent: 0,
        }
    }
}

impl PeerInfo {
    /// Peer serves the full chain (not a light client).
    pub fn is_full_node(&self) -> bool {
        self.services & NODE_NETWORK != 0
    }

    pub fn thin_block_capable(&self) -> bool {
        self.services & NODE_XTHIN != 0
    }
}

/// Exponentially decaying request counter. Replaces the legacy lock-free
/// float CAS loop with plain state under the already-held info lock.
#[derive(Debug)]
pub struct DecayCounter {
    value: f64,
    last_seen: u64,
}

impl DecayCounter {
    pub fn new() -> Self {
        Self {
            value: 0.0,
            last_seen: 0,
        }
    }

    fn decay_to(&mut self, now: u64) {
        if self.last_seen == 0 {
            self.last_seen = now;
        }
        let dt = now.saturating_sub(self.last_seen) as f64;
        self.value *= (1.0 - 1.0 / THIN_REQUEST_DECAY_SECONDS).powf(dt);
        self.last_seen = now;
    }

    /// Record one event and return the decayed count including it.
    pub fn bump(&mut self, now: u64) -> f64 {
        self.decay_to(now);
        self.value += 1.0;
        self.value
    }

    pub fn value(&mut self, now: u64) -> f64 {
        self.decay_to(now);
        self.value
    }
}

impl Default for DecayCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound buffer: framed messages awaiting the transport plus the pending
/// address trickle.
#[derive(Debug)]
pub struct SendQueue {
    queue: VecDeque<Message>,
    /// Total wire bytes queued; the backpressure signal.
    size: usize,
    pub addr_to_send: Vec<NetAddress>,
    pub addr_known: RollingBloomFilter,
}

impl SendQueue {
    fn new(salt: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            size: 0,
            addr_to_send: Vec::new(),
            addr_known: RollingBloomFilter::new(KNOWN_ADDR_CAPACITY, salt),
        }
    }
}

/// Inventory bookkeeping: pending announcements and the rolling filter of
/// what the peer already knows.
#[derive(Debug)]
pub struct PeerInventory {
    pub to_send: Vec<Inv>,
    pub known: RollingBloomFilter,
    /// Block hashes pending announcement (headers or inv, sender's choice).
    pub blocks_to_announce: Vec<Hash256>,
    /// After serving this block hash, inv our tip to trigger the peer's next
    /// getblocks batch.
    pub hash_continue: Option<Hash256>,
}

impl PeerInventory {
    fn new(salt: u32) -> Self {
        Self {
            to_send: Vec::new(),
            known: RollingBloomFilter::new(KNOWN_INV_CAPACITY, salt),
            blocks_to_announce: Vec::new(),
            hash_continue: None,
        }
    }
}

/// Inbound queue of framed messages, fed by the transport.
#[derive(Debug, Default)]
pub struct RecvQueue {
    pub queue: VecDeque<NetMessage>,
    pub size: usize,
}

/// Thin/compact block download bookkeeping, per in-flight hash.
#[derive(Debug, Clone, Copy)]
pub struct ThinBlockInFlight {
    pub requested_at: u64,
    pub received: bool,
}

/// One connected peer.
pub struct Peer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub inbound: bool,
    pub whitelisted: bool,
    pub one_shot: bool,
    pub feeler: bool,
    /// Connection establishment time, seconds.
    pub connected_at: u64,

    pub info: Mutex<PeerInfo>,
    pub inv_state: Mutex<PeerInventory>,
    pub filter: Mutex<Option<BloomFilter>>,
    send: Mutex<SendQueue>,
    pub recv: Mutex<RecvQueue>,
    /// getdata entries deferred by the one-block-per-pass yield rule.
    pub getdata_queue: Mutex<VecDeque<Inv>>,
    /// Thin-class blocks requested from this peer, for download timeouts.
    pub thin_in_flight: Mutex<HashMap<Hash256, ThinBlockInFlight>>,
    /// Write-serialization point; ping takes it exclusively so the pong
    /// stays contiguous with its nonce.
    pub msg_serializer: RwLock<()>,

    disconnect: AtomicBool,
    disconnect_request: AtomicBool,
    successfully_connected: AtomicBool,
    send_size: AtomicUsize,
    /// Bytes of useful traffic exchanged; the anti-leech signal.
    pub activity_bytes: AtomicU64,
    pub misbehavior: AtomicI32,
    pub max_blocks_in_transit: AtomicUsize,

    /// Wakes the peer's message-processing worker.
    pub notify: tokio::sync::Notify,
}

impl Peer {
    pub fn new(id: PeerId, addr: SocketAddr, inbound: bool, now: u64) -> Self {
        // Filter salts only need to differ between restarts and peers.
        let salt = (id as u32) ^ (now as u32);
        Self {
            id,
            addr,
            inbound,
            whitelisted: false,
            one_shot: false,
            feeler: false,
            connected_at: now,
            info: Mutex::new(PeerInfo::default()),
            inv_state: Mutex::new(PeerInventory::new(salt)),
            filter: Mutex::new(None),
            send: Mutex::new(SendQueue::new(salt.wrapping_add(1))),
            recv: Mutex::new(RecvQueue::default()),
            getdata_queue: Mutex::new(VecDeque::new()),
            thin_in_flight: Mutex::new(HashMap::new()),
            msg_serializer: RwLock::new(()),
            disconnect: AtomicBool::new(false),
            disconnect_request: AtomicBool::new(false),
            successfully_connected: AtomicBool::new(false),
            send_size: AtomicUsize::new(0),
            activity_bytes: AtomicU64::new(0),
            misbehavior: AtomicI32::new(0),
            max_blocks_in_transit: AtomicUsize::new(16),
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Short log tag: id plus address.
    pub fn log_name(&self) -> String {
        format!("{}@{}", self.id, self.addr)
    }

    // ---- lifecycle flags ----

    pub fn is_disconnecting(&self) -> bool {
        self.disconnect.load(Ordering::Acquire)
    }

    pub fn set_disconnect(&self) {
        self.disconnect.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Graceful disconnect: takes effect at the next send tick once no
    /// blocks remain in flight from this peer.
    pub fn request_disconnect(&self) {
        self.disconnect_request.store(true, Ordering::Release);
    }

    pub fn disconnect_requested(&self) -> bool {
        self.disconnect_request.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.successfully_connected.load(Ordering::Acquire)
    }

    pub fn mark_connected(&self) {
        self.successfully_connected.store(true, Ordering::Release);
    }

    // ---- outbound ----

    /// Queue an outbound message, accounting its wire size for
    /// backpressure.
    pub fn push_message(&self, msg: Message) {
        let size = msg.wire_size();
        let mut send = self.send.lock();
        send.size += size;
        send.queue.push_back(msg);
        self.send_size.store(send.size, Ordering::Release);
    }

    /// Queued outbound bytes.
    pub fn send_size(&self) -> usize {
        self.send_size.load(Ordering::Acquire)
    }

    /// Hand all queued messages to the transport, clearing the buffer.
    pub fn drain_send_queue(&self) -> Vec<Message> {
        let mut send = self.send.lock();
        send.size = 0;
        self.send_size.store(0, Ordering::Release);
        send.queue.drain(..).collect()
    }

    /// Queue an address for the trickled addr broadcast, if the peer does
    /// not already know it.
    pub fn push_address(&self, addr: &NetAddress) {
        let mut send = self.send.lock();
        if !send.addr_known.contains(&addr.key()) {
            send.addr_to_send.push(*addr);
        }
    }

    pub fn with_send_queue<R>(&self, f: impl FnOnce(&mut SendQueue) -> R) -> R {
        let mut send = self.send.lock();
        let out = f(&mut send);
        self.send_size.store(send.size, Ordering::Release);
        out
    }

    /// Queue an inventory announcement unless it is already known to the
    /// peer. Blocks are always queued; the sender may still upgrade them to
    /// a headers announcement.
    pub fn push_inventory(&self, inv: Inv) {
        let mut state = self.inv_state.lock();
        if inv.kind == InvKind::Tx && state.known.contains(inv.hash.as_bytes()) {
            return;
        }
        state.to_send.push(inv);
    }

    pub fn push_block_hash_to_announce(&self, hash: Hash256) {
        self.inv_state.lock().blocks_to_announce.push(hash);
    }

    pub fn mark_inventory_known(&self, inv: &Inv) {
        self.inv_state.lock().known.insert(inv.hash.as_bytes());
    }

    pub fn knows_inventory(&self, inv: &Inv) -> bool {
        self.inv_state.lock().known.contains(inv.hash.as_bytes())
    }

    // ---- inbound ----

    /// Called by the transport with a complete framed message.
    pub fn enqueue_incoming(&self, msg: NetMessage) {
        {
            let mut recv = self.recv.lock();
            recv.size += msg.size();
            recv.queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    // ---- ping bookkeeping ----

    pub fn record_ping_sent(&self, nonce: u64, now_micros: u64) {
        let mut info = self.info.lock();
        info.ping_nonce_sent = nonce;
        info.ping_start_micros = now_micros;
        info.ping_queued = false;
    }

    /// Match a pong nonce against the outstanding ping; on success records
    /// the round trip and clears the outstanding state.
    pub fn record_pong(&self, nonce: u64, now_micros: u64) -> bool {
        let mut info = self.info.lock();
        if info.ping_nonce_sent == 0 || nonce != info.ping_nonce_sent {
            return false;
        }
        let rtt = now_micros.saturating_sub(info.ping_start_micros);
        if rtt > 0 {
            info.last_ping_micros = Some(rtt);
            info.min_ping_micros = Some(info.min_ping_micros.map_or(rtt, |m| m.min(rtt)));
        }
        info.ping_nonce_sent = 0;
        true
    }

    // ---- thin block bookkeeping ----

    pub fn register_thin_block_request(&self, hash: Hash256, now: u64) {
        self.thin_in_flight.lock().insert(
            hash,
            ThinBlockInFlight {
                requested_at: now,
                received: false,
            },
        );
    }

    pub fn mark_thin_block_received(&self, hash: &Hash256) {
        if let Some(entry) = self.thin_in_flight.lock().get_mut(hash) {
            entry.received = true;
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("inbound", &self.inbound)
            .finish()
    }
}

/// Per-peer sync progress, kept under the chain lock because it is read and
/// written together with the block index.
#[derive(Debug, Default)]
pub struct NodeState {
    /// Best block this peer is known to have.
    pub best_known_block: Option<BlockId>,
    /// Last announced hash we have not indexed yet.
    pub last_unknown_block_hash: Option<Hash256>,
    /// Highest active-chain block we agree on; download frontier.
    pub last_common_block: Option<BlockId>,
    /// Last header we sent this peer via a headers announcement.
    pub best_header_sent: Option<BlockId>,
    /// Height the first headers batch must reach before the peer counts as
    /// a useful sync source.
    pub first_headers_expected_height: u64,
    pub first_headers_received: bool,
    pub sync_started: bool,
    /// When the current headers request went out, seconds.
    pub sync_start_time: u64,
    pub requested_initial_block_availability: bool,
    pub prefer_headers: bool,
    pub preferred_download: bool,
}

/// Registry of [`NodeState`] keyed by peer id.
#[derive(Debug, Default)]
pub struct NodeStateMap {
    states: HashMap<PeerId, NodeState>,
}

impl NodeStateMap {
    pub fn initialize(&mut self, id: PeerId) {
        self.states.insert(id, NodeState::default());
    }

    pub fn remove(&mut self, id: PeerId) -> Option<NodeState> {
        self.states.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&NodeState> {
        self.states.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut NodeState> {
        self.states.get_mut(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &NodeState)> {
        self.states.iter()
    }
}

/// Recompute a peer's preferred-download flag and keep the process-wide
/// counter in sync. Useful full-block sources only: not one-shot, not a
/// light client.
pub fn update_preferred_download(
    peer: &Peer,
    state: &mut NodeState,
    counter: &std::sync::atomic::AtomicI32,
) {
    if state.preferred_download {
        counter.fetch_sub(1, Ordering::AcqRel);
    }
    let preferred = !peer.one_shot && peer.info.lock().is_full_node();
    state.preferred_download = preferred;
    if preferred {
        counter.fetch_add(1, Ordering::AcqRel);
    }
    debug!(peer = %peer.log_name(), preferred, "preferred download updated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::Hash256;

    fn peer() -> Peer {
        Peer::new(1, "127.0.0.1:8343".parse().unwrap(), true, 1_700_000_000)
    }

    #[test]
    fn test_send_queue_accounting() {
        let p = peer();
        assert_eq!(p.send_size(), 0);
        p.push_message(Message::Ping(Some(1)));
        assert!(p.send_size() > 0);
        let drained = p.drain_send_queue();
        assert_eq!(drained.len(), 1);
        assert_eq!(p.send_size(), 0);
    }

    #[test]
    fn test_known_tx_inventory_suppressed() {
        let p = peer();
        let inv = Inv::tx(Hash256::from_byte(5));
        p.mark_inventory_known(&inv);
        p.push_inventory(inv);
        assert!(p.inv_state.lock().to_send.is_empty());
        // Blocks are never suppressed at queue time.
        let binv = Inv::block(Hash256::from_byte(5));
        p.mark_inventory_known(&binv);
        p.push_inventory(binv);
        assert_eq!(p.inv_state.lock().to_send.len(), 1);
    }

    #[test]
    fn test_pong_matching() {
        let p = peer();
        p.record_ping_sent(7, 1_000_000);
        // Wrong nonce leaves the ping outstanding.
        assert!(!p.record_pong(8, 2_000_000));
        assert_eq!(p.info.lock().ping_nonce_sent, 7);
        // Matching nonce records the round trip.
        assert!(p.record_pong(7, 3_000_000));
        let info = p.info.lock();
        assert_eq!(info.ping_nonce_sent, 0);
        assert_eq!(info.last_ping_micros, Some(2_000_000));
    }

    #[test]
    fn test_decay_counter_half_life() {
        let mut c = DecayCounter::new();
        let mut v = 0.0;
        for _ in 0..10 {
            v = c.bump(1000);
        }
        assert!((v - 10.0).abs() < 1e-9);
        // Ten minutes later the count has decayed to well under half.
        let decayed = c.value(1000 + 600);
        assert!(decayed < 4.0, "decayed value {decayed}");
        assert!(decayed > 1.0);
    }

    #[test]
    fn test_preferred_download_counter() {
        let counter = std::sync::atomic::AtomicI32::new(0);
        let p = peer();
        p.info.lock().services = NODE_NETWORK;
        let mut state = NodeState::default();
        update_preferred_download(&p, &mut state, &counter);
        assert!(state.preferred_download);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        // Losing NODE_NETWORK drops the flag and the counter together.
        p.info.lock().services = 0;
        update_preferred_download(&p, &mut state, &counter);
        assert!(!state.preferred_download);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }
}
