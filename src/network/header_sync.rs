//! Header chain synchronization.
//!
//! Handles inbound `headers` batches: contiguity checking, the bounded
//! unconnected-header cache, acceptance through the external validator,
//! continuation requests, availability refresh during initial download, and
//! direct fetch of announced blocks near the tip.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::network::peer::Peer;
use crate::network::protocol::{
    BlockHeader, Hash256, InvKind, Message, RawInv, MAX_HEADERS_RESULTS,
};
use crate::network::NetContext;

/// Cap on cached unconnected headers.
pub const MAX_UNCONNECTED_HEADERS: usize = 4_000;
/// Seconds an unconnected header may wait for its parent.
pub const UNCONNECTED_HEADERS_TIMEOUT: u64 = 60;

/// Bounded cache of headers whose parent we have not seen yet, keyed by
/// hash with arrival time. Entries either connect within a short window or
/// are dropped.
#[derive(Debug, Default)]
pub struct UnconnectedHeaderCache {
    map: HashMap<Hash256, (BlockHeader, u64)>,
}

impl UnconnectedHeaderCache {
    pub fn insert(&mut self, hash: Hash256, header: BlockHeader, now: u64) {
        if self.map.len() < MAX_UNCONNECTED_HEADERS {
            self.map.insert(hash, (header, now));
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.map.contains_key(hash)
    }

    /// Extend a contiguous header run with cached children, iterating to a
    /// fixed point, then drop expired entries and entries that now appear
    /// in the run itself.
    pub fn extend_and_purge(&mut self, headers: &mut Vec<BlockHeader>, now: u64) {
        loop {
            let tail_hash = match headers.last() {
                Some(h) => h.hash(),
                None => break,
            };
            let child = self
                .map
                .iter()
                .find(|(_, (header, _))| header.prev_block == tail_hash)
                .map(|(hash, (header, _))| (*hash, *header));
            match child {
                Some((hash, header)) => {
                    self.map.remove(&hash);
                    headers.push(header);
                }
                None => break,
            }
        }

        let accepted: std::collections::HashSet<Hash256> =
            headers.iter().map(|h| h.hash()).collect();
        self.map.retain(|hash, (_, arrived)| {
            now.saturating_sub(*arrived) < UNCONNECTED_HEADERS_TIMEOUT && !accepted.contains(hash)
        });
    }
}

/// Process a `headers` message from `peer`. Returns false when the message
/// was a protocol violation.
pub fn handle_headers(
    ctx: &NetContext,
    peer: &Arc<Peer>,
    mut headers: Vec<BlockHeader>,
    now: u64,
) -> bool {
    if headers.len() > MAX_HEADERS_RESULTS {
        ctx.dos.misbehaving(peer, 20, now);
        warn!(peer = %peer.log_name(), count = headers.len(), "oversized headers message");
        return false;
    }

    let batch_was_full = headers.len() == MAX_HEADERS_RESULTS;

    let mut guard = ctx.main.lock();
    let main = &mut *guard;

    // An empty reply means the peer has nothing past our locator; stop
    // asking it for more headers.
    if headers.is_empty() {
        return true;
    }

    // Walk the batch and find the first header that does not connect,
    // either to the index or to its predecessor in the list. Everything
    // from there on goes to the unconnected cache.
    let mut last_hash: Option<Hash256> = None;
    let mut unconnected = false;
    for header in &headers {
        if last_hash.is_none() && main.chain.index.contains(&header.prev_block) {
            last_hash = Some(header.prev_block);
        }
        if last_hash != Some(header.prev_block) {
            // A stale discontinuous batch while we are far behind is a sync
            // stalling attempt; drop the peer.
            if (header.time as u64) < now.saturating_sub(24 * 60 * 60) {
                warn!(
                    peer = %peer.log_name(),
                    "non-continuous headers sequence during sync, disconnecting"
                );
                peer.set_disconnect();
                return false;
            }
            unconnected = true;
        }
        if unconnected {
            let hash = header.hash();
            main.unconnected_headers.insert(hash, *header, now);
            // Keep availability fresh so the block remains fetchable from
            // this peer once the gap closes via someone else.
            if let Some(state) = main.node_states.get_mut(peer.id) {
                ctx.requester
                    .update_block_availability(&main.chain, state, hash);
            }
        }
        last_hash = Some(header.hash());
    }
    if unconnected {
        debug!(
            peer = %peer.log_name(),
            cached = main.unconnected_headers.len(),
            "queued unconnected headers"
        );
        return true;
    }

    // Try to lengthen the run with previously cached children.
    main.unconnected_headers.extend_and_purge(&mut headers, now);

    // Accept in dependency order; an invalid header truncates the rest of
    // the branch.
    let mut last_accepted = None;
    let mut accepted_count = 0usize;
    for header in &headers {
        match ctx
            .externals
            .validator
            .accept_block_header(&mut main.chain, header)
        {
            Ok(id) => {
                last_accepted = Some(id);
                accepted_count += 1;
            }
            Err(rejection) => {
                info!(
                    peer = %peer.log_name(),
                    reason = rejection.reason,
                    dos = rejection.dos_score,
                    "header rejected"
                );
                if rejection.dos_score > 0 {
                    ctx.dos.misbehaving(peer, rejection.dos_score, now);
                }
                break;
            }
        }
    }

    if let Some(last) = last_accepted {
        let hash = main.chain.index.entry(last).hash;
        if let Some(state) = main.node_states.get_mut(peer.id) {
            ctx.requester
                .update_block_availability(&main.chain, state, hash);
        }
    }

    // A full batch that ended on a valid tail means the peer likely has
    // more; continue immediately from the new tail.
    if batch_was_full && accepted_count == MAX_HEADERS_RESULTS {
        if let Some(last) = last_accepted {
            let locator = main.chain.locator(Some(last));
            let tail_hash = main.chain.index.entry(last).hash;
            let tail_work = main.chain.index.entry(last).chain_work;
            debug!(peer = %peer.log_name(), "continuing getheaders past full batch");
            peer.push_message(Message::GetHeaders {
                locator,
                hash_stop: Hash256::ZERO,
            });
            if let Some(state) = main.node_states.get_mut(peer.id) {
                state.sync_start_time = now;
            }

            // During initial download, nudge every other full node for this
            // header so its availability gets refreshed too.
            if main
                .chain
                .is_initial_block_download(now, ctx.params.max_tip_age)
            {
                for other in ctx.peer_snapshot() {
                    if other.id == peer.id || !other.info.lock().is_full_node() {
                        continue;
                    }
                    let behind = match main
                        .node_states
                        .get(other.id)
                        .and_then(|s| s.best_known_block)
                    {
                        Some(best) => main.chain.index.entry(best).chain_work < tail_work,
                        None => true,
                    };
                    if behind {
                        debug!(
                            peer = %other.log_name(),
                            "requesting header for block availability"
                        );
                        other.push_message(Message::GetHeaders {
                            locator: Default::default(),
                            hash_stop: tail_hash,
                        });
                    }
                }
            }
        }
    }

    // The first batch a sync peer sends must reach the height we were at
    // when we asked, otherwise any old valid header would satisfy us.
    if let Some(state) = main.node_states.get_mut(peer.id) {
        if !state.first_headers_received {
            if let Some(last) = last_accepted {
                if main.chain.index.entry(last).height >= state.first_headers_expected_height {
                    state.first_headers_received = true;
                    debug!(peer = %peer.log_name(), "initial headers received");
                }
            }
            // Permissive test networks may reorg past any fixed expectation.
            if !matches!(
                ctx.params.network,
                crate::config::Network::Main | crate::config::Network::Regtest
            ) {
                state.first_headers_received = true;
            }
        }
    }

    // Direct fetch: when our tip is recent and the announced branch has at
    // least as much work, request the missing blocks right away in chain
    // order.
    let can_fetch = main
        .chain
        .can_direct_fetch(now, ctx.params.pow_target_spacing);
    if let (true, Some(last)) = (can_fetch, last_accepted) {
        let tip_work = main
            .chain
            .tip_entry()
            .map(|t| t.chain_work)
            .unwrap_or_default();
        let last_entry = main.chain.index.entry(last);
        if !last_entry.is_invalid() && tip_work <= last_entry.chain_work {
            peer.max_blocks_in_transit.store(
                ctx.config.max_blocks_in_transit_per_peer,
                std::sync::atomic::Ordering::Release,
            );

            // Walk back to the active chain, then fetch forward.
            let mut to_walk = Vec::new();
            let mut cursor = Some(last);
            while let Some(id) = cursor {
                if main.chain.active.contains(&main.chain.index, id) {
                    break;
                }
                to_walk.push(id);
                cursor = main.chain.index.entry(id).parent;
            }

            let cap = ctx.config.max_blocks_in_transit_per_peer;
            let mut to_fetch = Vec::new();
            for id in to_walk.into_iter().rev() {
                let entry = main.chain.index.entry(id);
                if entry.has_data() {
                    continue;
                }
                if ctx.requester.num_blocks_in_flight(peer.id) + to_fetch.len() >= cap {
                    debug!(peer = %peer.log_name(), "direct fetch reached transit cap");
                    break;
                }
                if ctx.requester.mark_block_in_flight(entry.hash, peer.id, now) {
                    to_fetch.push(entry.hash);
                }
            }
            if !to_fetch.is_empty() {
                info!(
                    peer = %peer.log_name(),
                    count = to_fetch.len(),
                    "direct fetch via headers"
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
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash256, nonce: u32, time: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: Hash256::from_byte(0xbb),
            time,
            bits: 0x1d00ffff,
            nonce,
        }
    }

    #[test]
    fn test_cache_extends_to_fixed_point() {
        let h1 = header(Hash256::from_byte(1), 1, 100);
        let h2 = header(h1.hash(), 2, 101);
        let h3 = header(h2.hash(), 3, 102);

        let mut cache = UnconnectedHeaderCache::default();
        // Cached out of order.
        cache.insert(h3.hash(), h3, 10);
        cache.insert(h2.hash(), h2, 10);

        let mut run = vec![h1];
        cache.extend_and_purge(&mut run, 11);
        assert_eq!(run.len(), 3);
        assert_eq!(run[2].hash(), h3.hash());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_purges_expired() {
        let stray = header(Hash256::from_byte(7), 9, 100);
        let mut cache = UnconnectedHeaderCache::default();
        cache.insert(stray.hash(), stray, 10);

        let mut run = vec![header(Hash256::from_byte(1), 1, 100)];
        cache.extend_and_purge(&mut run, 10 + UNCONNECTED_HEADERS_TIMEOUT);
        assert!(cache.is_empty(), "expired entry must be dropped");
        assert_eq!(run.len(), 1);
    }

    #[test]
    fn test_cache_respects_cap() {
        let mut cache = UnconnectedHeaderCache::default();
        for i in 0..(MAX_UNCONNECTED_HEADERS + 10) {
            let h = header(Hash256::from_byte((i % 200) as u8), i as u32, 100);
            cache.insert(h.hash(), h, 1);
        }
        assert!(cache.len() <= MAX_UNCONNECTED_HEADERS);
    }
}
