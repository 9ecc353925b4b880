//! Block and transaction download scheduling across peers.
//!
//! The request manager owns the in-flight map. Handlers feed it what peers
//! announce (`ask_for_tx`, `update_block_availability`); the send loop asks
//! it what to fetch next (`request_next_blocks`, `run_tx_requests`) and to
//! police stalls (`disconnect_on_download_timeout`).
//!
//! Lock order: the chain lock is always taken before the manager's own
//! lock. Functions that need both take `&Chain`/`&mut NodeState` from a
//! caller already holding the chain lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::chain::{BlockId, Chain};
use crate::network::peer::{NodeState, Peer, PeerId};
use crate::network::protocol::{Hash256, Inv, InvKind, Message, RawInv};

/// Re-request interval for transactions, microseconds.
pub const TX_REQUEST_RETRY_INTERVAL: u64 = 5_000_000;
/// Re-request interval for blocks, microseconds. Thin-block timeouts are a
/// multiple of this.
pub const BLOCK_REQUEST_RETRY_INTERVAL: u64 = 5_000_000;
/// Jitter applied to a first transaction request, microseconds.
const TX_REQUEST_JITTER: u64 = 500_000;
/// How many peers may be asked for the same block at once.
pub const MAX_BLOCK_REQUEST_PARALLELISM: usize = 2;
/// Base stall allowance for block downloads, microseconds.
const DOWNLOAD_TIMEOUT_BASE: u64 = 30_000_000;
/// Additional allowance per in-flight block, microseconds.
const DOWNLOAD_TIMEOUT_PER_BLOCK: u64 = 10_000_000;
/// Stall allowance ceiling, microseconds.
const DOWNLOAD_TIMEOUT_MAX: u64 = 120_000_000;

#[derive(Debug)]
struct TxRequest {
    /// Candidate peers in announcement order, without duplicates.
    sources: VecDeque<PeerId>,
    /// Peer currently asked, with the request time.
    outstanding: Option<(PeerId, u64)>,
    /// Earliest time the next request may go out.
    due_at: u64,
    /// Set once the transaction entered the admission pipeline; suspends
    /// retries without forgetting the entry.
    processing: bool,
}

#[derive(Debug, Clone, Copy)]
struct BlockInFlight {
    peer: PeerId,
    requested_at: u64,
}

#[derive(Debug, Default)]
struct PeerDownloads {
    /// Hashes in flight from this peer, request order.
    blocks: Vec<Hash256>,
    /// Reject messages received from this peer, for misbehavior feeding.
    rejects: u32,
}

#[derive(Default)]
struct Inner {
    tx_requests: HashMap<Hash256, TxRequest>,
    blocks_in_flight: HashMap<Hash256, Vec<BlockInFlight>>,
    peers: HashMap<PeerId, PeerDownloads>,
    /// Last time each block hash was requested from anyone; zeroed when a
    /// peer departs so the hash may be re-requested immediately.
    last_block_request: HashMap<Hash256, u64>,
}

/// Multi-peer download scheduler.
pub struct RequestManager {
    inner: Mutex<Inner>,
    max_blocks_in_transit_per_peer: usize,
    block_download_window: u64,
}

impl RequestManager {
    pub fn new(max_blocks_in_transit_per_peer: usize, block_download_window: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_blocks_in_transit_per_peer,
            block_download_window,
        }
    }

    // ---- lifecycle ----

    pub fn initialize_peer(&self, id: PeerId) {
        self.inner.lock().peers.insert(id, PeerDownloads::default());
    }

    /// Remove every trace of a departing peer. In-flight blocks become
    /// immediately requestable from someone else.
    pub fn finalize_peer(&self, id: PeerId) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.peers.remove(&id) {
            for hash in state.blocks {
                if let Some(entries) = inner.blocks_in_flight.get_mut(&hash) {
                    entries.retain(|e| e.peer != id);
                    if entries.is_empty() {
                        inner.blocks_in_flight.remove(&hash);
                    }
                }
                inner.last_block_request.insert(hash, 0);
            }
        }
        for req in inner.tx_requests.values_mut() {
            req.sources.retain(|p| *p != id);
            if matches!(req.outstanding, Some((p, _)) if p == id) {
                req.outstanding = None;
                req.due_at = 0;
            }
        }
        inner.tx_requests.retain(|_, req| {
            req.outstanding.is_some() || !req.sources.is_empty() || req.processing
        });
    }

    /// True when nothing at all is in flight; checked after the last peer
    /// leaves.
    pub fn in_flight_is_empty(&self) -> bool {
        self.inner.lock().blocks_in_flight.is_empty()
    }

    // ---- transaction scheduling ----

    /// Queue a transaction fetch candidate. Duplicate peers are suppressed;
    /// the first announcement fixes the jittered earliest-send time.
    pub fn ask_for_tx(&self, hash: Hash256, peer: PeerId, now: u64) {
        let mut inner = self.inner.lock();
        let jitter = rand::thread_rng().gen_range(0..TX_REQUEST_JITTER);
        let req = inner.tx_requests.entry(hash).or_insert_with(|| TxRequest {
            sources: VecDeque::new(),
            outstanding: None,
            due_at: now + jitter,
            processing: false,
        });
        if req.sources.contains(&peer) || matches!(req.outstanding, Some((p, _)) if p == peer) {
            return;
        }
        req.sources.push_back(peer);
    }

    /// The transaction reached the admission pipeline; stop re-requesting.
    pub fn processing(&self, hash: &Hash256, _peer: PeerId) {
        if let Some(req) = self.inner.lock().tx_requests.get_mut(hash) {
            req.processing = true;
        }
    }

    /// A response for the asked transaction arrived; the entry is complete.
    pub fn update_txn_response_time(&self, hash: &Hash256, peer: PeerId, now: u64) {
        let mut inner = self.inner.lock();
        if let Some(req) = inner.tx_requests.get(hash) {
            if let Some((asked, at)) = req.outstanding {
                if asked == peer {
                    debug!(
                        txid = %hash,
                        micros = now.saturating_sub(at),
                        "txn response time"
                    );
                }
            }
        }
        inner.tx_requests.remove(hash);
    }

    /// A peer rejected something we asked for. Frees the slot so another
    /// source may be tried, and returns the peer's running reject count so
    /// the caller can feed misbehavior on excess.
    pub fn rejected(&self, inv: &Inv, peer: PeerId) -> u32 {
        let mut inner = self.inner.lock();
        match inv.kind {
            InvKind::Tx => {
                if let Some(req) = inner.tx_requests.get_mut(&inv.hash) {
                    req.sources.retain(|p| *p != peer);
                    if matches!(req.outstanding, Some((p, _)) if p == peer) {
                        req.outstanding = None;
                        req.due_at = 0;
                    }
                }
            }
            _ => {
                Self::remove_in_flight(&mut inner, &inv.hash, peer);
                inner.last_block_request.insert(inv.hash, 0);
            }
        }
        let state = inner.peers.entry(peer).or_default();
        state.rejects += 1;
        state.rejects
    }

    /// Emit due transaction getdata requests. `resolve` maps a peer id to a
    /// live connection; `already_have` short-circuits entries satisfied in
    /// the meantime.
    pub fn run_tx_requests(
        &self,
        now: u64,
        resolve: impl Fn(PeerId) -> Option<Arc<Peer>>,
        already_have: impl Fn(&Hash256) -> bool,
    ) {
        let mut inner = self.inner.lock();
        let mut done = Vec::new();
        let mut to_send: Vec<(Arc<Peer>, Hash256)> = Vec::new();

        for (hash, req) in inner.tx_requests.iter_mut() {
            if req.processing {
                continue;
            }
            if already_have(hash) {
                done.push(*hash);
                continue;
            }
            if let Some((peer, at)) = req.outstanding {
                if now.saturating_sub(at) < TX_REQUEST_RETRY_INTERVAL {
                    continue;
                }
                debug!(txid = %hash, peer, "tx request timed out, trying next source");
                req.outstanding = None;
            }
            if now < req.due_at {
                continue;
            }
            // Find the next live source.
            let mut chosen = None;
            while let Some(candidate) = req.sources.pop_front() {
                match resolve(candidate) {
                    Some(peer) if !peer.is_disconnecting() => {
                        chosen = Some(peer);
                        break;
                    }
                    _ => continue,
                }
            }
            match chosen {
                Some(peer) => {
                    req.outstanding = Some((peer.id, now));
                    to_send.push((peer, *hash));
                }
                None => done.push(*hash),
            }
        }
        for hash in done {
            inner.tx_requests.remove(&hash);
        }
        drop(inner);

        for (peer, hash) in to_send {
            debug!(peer = %peer.log_name(), txid = %hash, "requesting tx");
            peer.push_message(Message::GetData(vec![RawInv {
                kind: InvKind::Tx.to_u32(),
                hash,
            }]));
        }
    }

    /// Pending transaction request entries, for introspection and tests.
    pub fn tx_request_count(&self) -> usize {
        self.inner.lock().tx_requests.len()
    }

    // ---- block availability (requires chain lock held) ----

    /// Resolve a deferred "last unknown" announcement once its header shows
    /// up in the index.
    pub fn process_block_availability(&self, chain: &Chain, state: &mut NodeState) {
        if let Some(hash) = state.last_unknown_block_hash {
            if let Some(id) = chain.index.get(&hash) {
                let work = chain.index.entry(id).chain_work;
                let better = match state.best_known_block {
                    Some(best) => chain.index.entry(best).chain_work < work,
                    None => true,
                };
                if better {
                    state.best_known_block = Some(id);
                }
                state.last_unknown_block_hash = None;
            }
        }
    }

    /// Record that a peer announced `hash`, updating its best-known block
    /// when we can place the hash in the index.
    pub fn update_block_availability(&self, chain: &Chain, state: &mut NodeState, hash: Hash256) {
        self.process_block_availability(chain, state);
        match chain.index.get(&hash) {
            Some(id) => {
                let work = chain.index.entry(id).chain_work;
                let better = match state.best_known_block {
                    Some(best) => chain.index.entry(best).chain_work < work,
                    None => true,
                };
                if better {
                    state.best_known_block = Some(id);
                }
            }
            None => state.last_unknown_block_hash = Some(hash),
        }
    }

    // ---- block scheduling ----

    fn remove_in_flight(inner: &mut Inner, hash: &Hash256, peer: PeerId) {
        if let Some(entries) = inner.blocks_in_flight.get_mut(hash) {
            entries.retain(|e| e.peer != peer);
            if entries.is_empty() {
                inner.blocks_in_flight.remove(hash);
            }
        }
        if let Some(state) = inner.peers.get_mut(&peer) {
            state.blocks.retain(|h| h != hash);
        }
    }

    /// Record a block request we are about to send. Returns false when the
    /// pair already exists or the parallelism cap is reached.
    pub fn mark_block_in_flight(&self, hash: Hash256, peer: PeerId, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let entries = inner.blocks_in_flight.entry(hash).or_default();
        if entries.iter().any(|e| e.peer == peer) {
            return false;
        }
        if entries.len() >= MAX_BLOCK_REQUEST_PARALLELISM {
            return false;
        }
        entries.push(BlockInFlight {
            peer,
            requested_at: now,
        });
        inner.peers.entry(peer).or_default().blocks.push(hash);
        inner.last_block_request.insert(hash, now);
        true
    }

    /// A block arrived (from anyone): clear every in-flight row for it.
    pub fn block_received(&self, hash: &Hash256) {
        let mut inner = self.inner.lock();
        if let Some(entries) = inner.blocks_in_flight.remove(hash) {
            for e in entries {
                if let Some(state) = inner.peers.get_mut(&e.peer) {
                    state.blocks.retain(|h| h != hash);
                }
            }
        }
        inner.last_block_request.remove(hash);
    }

    pub fn blocks_in_flight_for(&self, peer: PeerId) -> Vec<Hash256> {
        self.inner
            .lock()
            .peers
            .get(&peer)
            .map(|s| s.blocks.clone())
            .unwrap_or_default()
    }

    pub fn num_blocks_in_flight(&self, peer: PeerId) -> usize {
        self.inner
            .lock()
            .peers
            .get(&peer)
            .map(|s| s.blocks.len())
            .unwrap_or(0)
    }

    pub fn is_in_flight(&self, hash: &Hash256) -> bool {
        self.inner.lock().blocks_in_flight.contains_key(hash)
    }

    /// Select and request the next blocks to download from this peer,
    /// bounded by the per-peer transit cap and the download window. The
    /// caller holds the chain lock.
    pub fn request_next_blocks(
        &self,
        peer: &Peer,
        chain: &Chain,
        state: &mut NodeState,
        now: u64,
    ) -> usize {
        self.process_block_availability(chain, state);

        let best = match state.best_known_block {
            Some(b) => b,
            None => return 0,
        };
        let tip = match chain.tip() {
            Some(t) => t,
            None => return 0,
        };
        // A peer with less cumulative work than our tip is no download source.
        if chain.index.entry(best).chain_work < chain.index.entry(tip).chain_work {
            return 0;
        }

        let tip_height = chain.index.entry(tip).height;
        let best_height = chain.index.entry(best).height;

        // Establish the download frontier: the deepest block we share.
        let mut last_common = match state.last_common_block {
            Some(id) => id,
            None => {
                let h = tip_height.min(best_height);
                match chain.index.ancestor(best, h) {
                    Some(id) => id,
                    None => return 0,
                }
            }
        };
        // Bring last_common onto the best-known branch.
        last_common = match common_ancestor(chain, last_common, best) {
            Some(id) => id,
            None => return 0,
        };
        state.last_common_block = Some(last_common);

        let cap = peer
            .max_blocks_in_transit
            .load(std::sync::atomic::Ordering::Acquire)
            .min(self.max_blocks_in_transit_per_peer.max(1));
        let in_flight = self.num_blocks_in_flight(peer.id);
        if in_flight >= cap {
            return 0;
        }
        let budget = cap - in_flight;

        let window_end = tip_height + self.block_download_window;
        let max_height = best_height.min(window_end);

        let mut to_fetch = Vec::new();
        let mut walk_height = chain.index.entry(last_common).height;
        while walk_height < max_height && to_fetch.len() < budget {
            walk_height += 1;
            let candidate = match chain.index.ancestor(best, walk_height) {
                Some(id) => id,
                None => break,
            };
            let entry = chain.index.entry(candidate);
            if entry.is_invalid() {
                // Nothing past an invalid block is fetchable on this branch.
                break;
            }
            if entry.has_data() {
                // Advance the frontier past blocks we already hold.
                state.last_common_block = Some(candidate);
                continue;
            }
            if self.mark_block_in_flight(entry.hash, peer.id, now) {
                to_fetch.push(entry.hash);
            }
        }

        if !to_fetch.is_empty() {
            debug!(
                peer = %peer.log_name(),
                count = to_fetch.len(),
                "requesting next blocks"
            );
            peer.push_message(Message::GetData(
                to_fetch
                    .iter()
                    .map(|hash| RawInv {
                        kind: InvKind::Block.to_u32(),
                        hash: *hash,
                    })
                    .collect(),
            ));
        }
        to_fetch.len()
    }

    /// Disconnect a peer that has stalled a block download. The allowance
    /// grows with the number of blocks in flight but stays bounded.
    pub fn disconnect_on_download_timeout(&self, peer: &Peer, now: u64) -> bool {
        let oldest = {
            let inner = self.inner.lock();
            let Some(state) = inner.peers.get(&peer.id) else {
                return false;
            };
            state
                .blocks
                .iter()
                .filter_map(|hash| {
                    inner
                        .blocks_in_flight
                        .get(hash)
                        .and_then(|entries| entries.iter().find(|e| e.peer == peer.id))
                        .map(|e| e.requested_at)
                })
                .min()
        };
        let Some(oldest) = oldest else { return false };

        let in_flight = self.num_blocks_in_flight(peer.id) as u64;
        let allowance =
            (DOWNLOAD_TIMEOUT_BASE + DOWNLOAD_TIMEOUT_PER_BLOCK * in_flight).min(DOWNLOAD_TIMEOUT_MAX);
        if now.saturating_sub(oldest) <= allowance {
            return false;
        }
        if peer.whitelisted {
            info!(peer = %peer.log_name(), "whitelisted peer stalling block download");
            return false;
        }
        warn!(
            peer = %peer.log_name(),
            stalled_micros = now.saturating_sub(oldest),
            "disconnecting peer for block download timeout"
        );
        peer.set_disconnect();
        true
    }
}

/// Deepest common ancestor of two index entries.
fn common_ancestor(chain: &Chain, a: BlockId, b: BlockId) -> Option<BlockId> {
    let ha = chain.index.entry(a).height;
    let hb = chain.index.entry(b).height;
    let h = ha.min(hb);
    let mut a = chain.index.ancestor(a, h)?;
    let mut b = chain.index.ancestor(b, h)?;
    while a != b {
        a = chain.index.entry(a).parent?;
        b = chain.index.entry(b).parent?;
    }
    Some(a)
}
