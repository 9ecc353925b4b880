//! Network layer: peer state, message dispatch, and synchronization
//! scheduling.
//!
//! The shared mutable state lives in one [`NetContext`] constructed at
//! startup; handlers receive it explicitly instead of reaching for
//! globals. External collaborators (validation, storage, mempool,
//! admission, the address book) are injected as trait objects.
//!
//! Lock order, outermost first, never reversed:
//! 1. chain state (`NetContext::main`)
//! 2. per-peer inventory
//! 3. per-peer filter
//! 4. per-peer send buffer
//! 5. relay map
//! 6. peer registry (node list)

pub mod bloom;
pub mod dispatcher;
pub mod dos;
pub mod header_sync;
pub mod partition;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod request_manager;
pub mod sender;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chain::{BlockId, Chain};
use crate::config::{ChainParams, NodeConfig};
use crate::network::dos::DosManager;
use crate::network::header_sync::UnconnectedHeaderCache;
use crate::network::partition::PartitionMonitor;
use crate::network::peer::{NodeStateMap, Peer, PeerId};
use crate::network::protocol::{Block, BlockHeader, Hash256, NetAddress, Transaction};
use crate::network::relay::RelayMap;
use crate::network::request_manager::RequestManager;

/// Header rejected by consensus validation, with its DoS weight.
#[derive(Debug, Clone)]
pub struct HeaderRejection {
    pub reason: &'static str,
    pub dos_score: i32,
}

/// Consensus-side header acceptance. Implementations index the header (via
/// [`Chain`]) after contextual checks pass.
pub trait HeaderValidator: Send + Sync {
    fn accept_block_header(
        &self,
        chain: &mut Chain,
        header: &BlockHeader,
    ) -> Result<BlockId, HeaderRejection>;
}

/// Identity attached to a transaction entering admission.
#[derive(Debug, Clone)]
pub struct TxSource {
    pub peer: PeerId,
    pub peer_name: String,
    pub whitelisted: bool,
}

/// Downstream block validation and storage.
pub trait BlockProcessor: Send + Sync {
    /// Hand a fully received block to validation. Must not block on network
    /// I/O; heavy work happens on the processor's own threads.
    fn process_new_block(&self, block: Block, source: PeerId);

    /// Side-band forwarding of a plausible new block ahead of validation.
    fn forward_expedited(&self, _block: &Block, _from: PeerId) {}
}

/// Read access to stored blocks.
pub trait BlockStore: Send + Sync {
    fn read_block(&self, hash: &Hash256) -> Option<Block>;
}

/// Read access to the mempool.
pub trait MempoolView: Send + Sync {
    fn get(&self, txid: &Hash256) -> Option<Transaction>;
    fn query_hashes(&self) -> Vec<Hash256>;
}

/// Queue feeding the transaction admission pipeline.
pub trait TxAdmissionQueue: Send + Sync {
    fn enqueue(&self, tx: Transaction, source: TxSource);
}

/// Optional thin-block codec. When absent, thin-block getdata requests are
/// served as full blocks.
pub trait ThinBlockRelay: Send + Sync {
    fn send_thin_block(&self, block: &Block, peer: &Arc<Peer>);
}

/// The address manager. Persistence and bucketing live outside the core.
pub trait AddressBook: Send + Sync {
    /// Add gossiped addresses, optionally time-penalized.
    fn add(&self, addrs: &[NetAddress], source: SocketAddr, penalty_seconds: u64);
    /// Mark an address as known-good after a successful handshake.
    fn good(&self, addr: SocketAddr);
    /// Randomized sample for a `getaddr` reply.
    fn addresses(&self) -> Vec<NetAddress>;
    fn len(&self) -> usize;
}

/// The injected collaborator set.
pub struct Externals {
    pub validator: Arc<dyn HeaderValidator>,
    pub processor: Arc<dyn BlockProcessor>,
    pub store: Arc<dyn BlockStore>,
    pub mempool: Arc<dyn MempoolView>,
    pub admission: Arc<dyn TxAdmissionQueue>,
    pub addrbook: Arc<dyn AddressBook>,
    pub thin: Option<Arc<dyn ThinBlockRelay>>,
}

/// State guarded by the chain lock: the header tree and active chain, the
/// per-peer sync states read alongside them, the unconnected-header cache,
/// and the block source map for validation feedback.
pub struct MainState {
    pub chain: Chain,
    pub node_states: NodeStateMap,
    pub unconnected_headers: UnconnectedHeaderCache,
    pub block_source: HashMap<Hash256, PeerId>,
}

impl MainState {
    fn new(chain: Chain) -> Self {
        Self {
            chain,
            node_states: NodeStateMap::default(),
            unconnected_headers: UnconnectedHeaderCache::default(),
            block_source: HashMap::new(),
        }
    }
}

/// Rolling 24-hour outbound byte meter backing the historical-block serving
/// limit.
pub struct OutboundMeter {
    inner: Mutex<(u64, u64)>, // (window_start, bytes)
    limit: Option<u64>,
}

impl OutboundMeter {
    fn new(limit: Option<u64>) -> Self {
        Self {
            inner: Mutex::new((0, 0)),
            limit,
        }
    }

    pub fn record(&self, bytes: u64, now: u64) {
        let mut inner = self.inner.lock();
        if now.saturating_sub(inner.0) >= 24 * 60 * 60 {
            *inner = (now, 0);
        }
        inner.1 = inner.1.saturating_add(bytes);
    }

    /// Whether the serving budget is spent for this window.
    pub fn target_reached(&self, now: u64) -> bool {
        let Some(limit) = self.limit else { return false };
        let mut inner = self.inner.lock();
        if now.saturating_sub(inner.0) >= 24 * 60 * 60 {
            *inner = (now, 0);
        }
        inner.1 >= limit
    }
}

/// Process-wide shared state for the peer subsystem, built once at startup.
pub struct NetContext {
    pub config: NodeConfig,
    pub params: ChainParams,
    /// Nonce carried in our version messages; detects self-connects.
    pub local_nonce: u64,
    /// Salt for the deterministic 24-hour address relay rotation.
    pub addr_relay_salt: u64,

    pub main: Mutex<MainState>,
    pub requester: RequestManager,
    pub dos: DosManager,
    pub relay: RelayMap,
    pub partition: PartitionMonitor,
    pub outbound: OutboundMeter,
    pub externals: Externals,

    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    next_peer_id: AtomicU64,

    /// Mirror of the preferred-download flags across live peers.
    pub preferred_download: AtomicI32,
    /// Peers we currently sync headers from.
    pub sync_started: AtomicI32,
    /// Light/pruned peers ever picked as header-sync sources; only one may
    /// drive the headers download.
    pub sync_started_pruned: AtomicI32,

    /// Our externally visible address, as reported by peers during the
    /// handshake. Drives periodic self-advertising.
    pub local_address: Mutex<Option<NetAddress>>,

    warning: Mutex<Option<String>>,
    shutdown_requested: AtomicBool,
}

impl NetContext {
    pub fn new(config: NodeConfig, params: ChainParams, chain: Chain, externals: Externals) -> Arc<Self> {
        let mut nonce = 0u64;
        while nonce == 0 {
            nonce = rand::thread_rng().gen();
        }
        Arc::new(Self {
            requester: RequestManager::new(
                config.max_blocks_in_transit_per_peer,
                config.block_download_window,
            ),
            dos: DosManager::new(config.ban_time_seconds),
            relay: RelayMap::new(),
            partition: PartitionMonitor::new(),
            outbound: OutboundMeter::new(config.max_outbound_bytes_per_day),
            main: Mutex::new(MainState::new(chain)),
            peers: RwLock::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            preferred_download: AtomicI32::new(0),
            sync_started: AtomicI32::new(0),
            sync_started_pruned: AtomicI32::new(0),
            local_address: Mutex::new(None),
            warning: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
            local_nonce: nonce,
            addr_relay_salt: rand::thread_rng().gen(),
            externals,
            config,
            params,
        })
    }

    // ---- peer lifecycle ----

    /// Register a newly accepted connection: allocate an id, create the
    /// node state and request-manager rows.
    pub fn initialize_peer(
        &self,
        addr: SocketAddr,
        inbound: bool,
        whitelisted: bool,
        one_shot: bool,
        feeler: bool,
        now: u64,
    ) -> Arc<Peer> {
        let id = self.next_peer_id.fetch_add(1, Ordering::AcqRel);
        let mut peer = Peer::new(id, addr, inbound, now);
        peer.whitelisted = whitelisted;
        peer.one_shot = one_shot;
        peer.feeler = feeler;
        peer.max_blocks_in_transit.store(
            self.config.max_blocks_in_transit_per_peer,
            Ordering::Release,
        );
        let peer = Arc::new(peer);

        self.main.lock().node_states.initialize(id);
        self.requester.initialize_peer(id);
        self.peers.write().insert(id, peer.clone());
        info!(peer = %peer.log_name(), inbound, "peer initialized");
        peer
    }

    /// Tear down a departing peer exactly once: flush its in-flight blocks
    /// back to the pool, fix the counters, drop its state.
    pub fn finalize_peer(&self, id: PeerId) {
        let Some(peer) = self.peers.write().remove(&id) else {
            return;
        };
        {
            let mut main = self.main.lock();
            if let Some(state) = main.node_states.remove(id) {
                if state.sync_started {
                    self.sync_started.fetch_sub(1, Ordering::AcqRel);
                }
                if state.preferred_download {
                    self.preferred_download.fetch_sub(1, Ordering::AcqRel);
                }
            }
            self.requester.finalize_peer(id);

            if main.node_states.is_empty() {
                // Consistency check after the last peer: force a clean slate
                // if an invariant slipped.
                if !self.requester.in_flight_is_empty() {
                    error!("in-flight map not empty after last peer; resetting");
                }
                let preferred = self.preferred_download.swap(0, Ordering::AcqRel);
                if preferred != 0 {
                    error!(preferred, "preferred-download counter skewed after last peer");
                }
            }
        }
        info!(peer = %peer.log_name(), "peer finalized");
    }

    pub fn peer(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().get(&id).cloned()
    }

    pub fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().values().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    // ---- shared queries ----

    pub fn is_initial_block_download(&self, now: u64) -> bool {
        self.main
            .lock()
            .chain
            .is_initial_block_download(now, self.params.max_tip_age)
    }

    /// Whether a transaction is already known via the relay window or the
    /// mempool.
    pub fn already_have_tx(&self, txid: &Hash256, now: u64) -> bool {
        self.relay.contains(txid, now) || self.externals.mempool.get(txid).is_some()
    }

    // ---- abort contract ----

    /// Record a user-visible warning.
    pub fn set_warning(&self, message: String) {
        warn!("{}", message);
        *self.warning.lock() = Some(message);
    }

    pub fn warning(&self) -> Option<String> {
        self.warning.lock().clone()
    }

    /// Fatal condition: surface a warning and ask the host process to shut
    /// down. The core never exits directly.
    pub fn abort_node(&self, message: &str) {
        error!("*** {}", message);
        self.set_warning(message.to_string());
        self.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

/// Background orchestration: the per-peer message workers, the periodic
/// send sweep, and maintenance tasks. The transport layer hands completed
/// frames to [`Peer::enqueue_incoming`] and drains
/// [`Peer::drain_send_queue`] after each sweep.
pub struct NetworkService {
    ctx: Arc<NetContext>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl NetworkService {
    pub fn new(ctx: Arc<NetContext>) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<NetContext> {
        &self.ctx
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the periodic send sweep and maintenance tasks.
    pub fn start(&self) {
        self.spawn_send_sweep();
        self.spawn_maintenance();
    }

    /// Attach a connected peer: spawns its message-processing worker. At
    /// most one worker processes a given peer's messages at a time; many
    /// peers proceed concurrently.
    pub fn attach_peer(&self, peer: Arc<Peer>) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = peer.notify.notified() => {}
                }
                if peer.is_disconnecting() {
                    break;
                }
                let ok = dispatcher::process_messages(&ctx, &peer, &cancel);
                if !ok {
                    peer.set_disconnect();
                    break;
                }
            }
            ctx.finalize_peer(peer.id);
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_send_sweep(&self) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = crate::utils::current_time_micros();
                for peer in ctx.peer_snapshot() {
                    sender::send_messages(&ctx, &peer, now);
                    if peer.is_disconnecting() {
                        // wake the worker so it observes the flag and exits
                        peer.notify.notify_one();
                    }
                }
                let peers = ctx.peer_snapshot();
                let resolve =
                    |id: PeerId| peers.iter().find(|p| p.id == id && !p.is_disconnecting()).cloned();
                let now_secs = now / 1_000_000;
                ctx.requester
                    .run_tx_requests(now, resolve, |hash| ctx.already_have_tx(hash, now_secs));
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_maintenance(&self) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let now = crate::utils::current_timestamp();
                let swept = ctx.dos.sweep_expired(now);
                if swept > 0 {
                    debug!(swept, "expired bans removed");
                }
                ctx.relay.sweep_expired(now);

                let ibd = ctx.is_initial_block_download(now);
                let warning = {
                    let main = ctx.main.lock();
                    ctx.partition
                        .check(&main.chain, now, ctx.params.pow_target_spacing, ibd)
                };
                if let Some(w) = warning {
                    ctx.set_warning(w.message());
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Cooperative shutdown: cancel every task and wait for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}
