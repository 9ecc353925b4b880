//! Header tree and active chain bookkeeping.
//!
//! The block index is an arena keyed by hash: nodes hold parent *indices*
//! rather than pointers, so ancestor walks are index chases and the tree has
//! a single owner. Consensus validation of headers and blocks lives behind
//! the collaborator traits in [`crate::network`]; this module only tracks
//! structure, status bits and cumulative work.

use std::collections::HashMap;

use thiserror::Error;

use crate::network::protocol::{BlockHeader, BlockLocator, Hash256};

/// Arena index of a block-index entry.
pub type BlockId = usize;

/// Status bits carried by each index entry.
pub mod status {
    /// Header passed contextual checks.
    pub const HEADER_VALID: u32 = 1 << 0;
    /// Full block data is stored and servable.
    pub const HAVE_DATA: u32 = 1 << 1;
    /// Block fully validated including scripts.
    pub const VALID_SCRIPTS: u32 = 1 << 2;
    /// Block exceeds our excessive-size policy; never served off-chain.
    pub const EXCESSIVE: u32 = 1 << 3;
    /// Block or an ancestor failed validation.
    pub const INVALID: u32 = 1 << 4;
}

/// One node of the header tree.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub hash: Hash256,
    pub header: BlockHeader,
    pub height: u64,
    pub parent: Option<BlockId>,
    /// Cumulative work up to and including this header.
    pub chain_work: u128,
    pub status: u32,
}

impl IndexEntry {
    pub fn has_data(&self) -> bool {
        self.status & status::HAVE_DATA != 0
    }

    pub fn is_excessive(&self) -> bool {
        self.status & status::EXCESSIVE != 0
    }

    pub fn is_invalid(&self) -> bool {
        self.status & status::INVALID != 0
    }

    pub fn scripts_valid(&self) -> bool {
        self.status & status::VALID_SCRIPTS != 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("previous block unknown")]
    UnknownParent,
}

/// Coarse work contribution of a header: `2^256 / (target + 1)` computed in
/// log-scaled integer form. Good enough for peer-side most-work comparisons;
/// exact work accounting is the validator's concern.
pub fn work_from_bits(bits: u32) -> u128 {
    let mantissa = (bits & 0x00ff_ffff) as u128;
    let exponent = (bits >> 24) as i64;
    if mantissa == 0 {
        return 0;
    }
    // target = mantissa * 2^(8*(exponent-3)); work ~ 2^(256-8*(exp-3)) / mantissa
    let shift = 256i64.saturating_sub(8 * (exponent - 3));
    if shift <= 0 {
        return 1;
    }
    let capped = shift.min(120) as u32;
    ((1u128 << capped) / mantissa).max(1)
}

/// Hash-keyed arena of block headers.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, BlockId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, hash: &Hash256) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn entry(&self, id: BlockId) -> &IndexEntry {
        &self.entries[id]
    }

    pub fn entry_mut(&mut self, id: BlockId) -> &mut IndexEntry {
        &mut self.entries[id]
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// Insert a header whose parent is already indexed (or which is a
    /// genesis). Re-inserting an existing header returns its id unchanged.
    pub fn connect_header(&mut self, header: BlockHeader) -> Result<BlockId, IndexError> {
        let hash = header.hash();
        if let Some(id) = self.get(&hash) {
            return Ok(id);
        }
        let (parent, height, parent_work) = if header.prev_block.is_zero() {
            (None, 0, 0)
        } else {
            let pid = self
                .get(&header.prev_block)
                .ok_or(IndexError::UnknownParent)?;
            let p = self.entry(pid);
            (Some(pid), p.height + 1, p.chain_work)
        };
        let id = self.entries.len();
        self.entries.push(IndexEntry {
            hash,
            header,
            height,
            parent,
            chain_work: parent_work + work_from_bits(header.bits),
            status: status::HEADER_VALID,
        });
        self.by_hash.insert(hash, id);
        Ok(id)
    }

    /// Ancestor of `id` at `height`, walking parent indices.
    pub fn ancestor(&self, id: BlockId, height: u64) -> Option<BlockId> {
        let mut cur = id;
        if self.entry(cur).height < height {
            return None;
        }
        while self.entry(cur).height > height {
            cur = self.entry(cur).parent?;
        }
        Some(cur)
    }

    pub fn set_status(&mut self, id: BlockId, bits: u32) {
        self.entries[id].status |= bits;
    }
}

/// The active chain: one entry per height, genesis first.
#[derive(Debug, Default)]
pub struct ActiveChain {
    chain: Vec<BlockId>,
}

impl ActiveChain {
    pub fn tip(&self) -> Option<BlockId> {
        self.chain.last().copied()
    }

    pub fn height(&self) -> Option<u64> {
        self.chain.len().checked_sub(1).map(|h| h as u64)
    }

    pub fn at_height(&self, height: u64) -> Option<BlockId> {
        self.chain.get(height as usize).copied()
    }

    pub fn contains(&self, index: &BlockIndex, id: BlockId) -> bool {
        self.at_height(index.entry(id).height) == Some(id)
    }

    /// Successor of `id` on the active chain, if `id` is on it.
    pub fn next(&self, index: &BlockIndex, id: BlockId) -> Option<BlockId> {
        if !self.contains(index, id) {
            return None;
        }
        self.at_height(index.entry(id).height + 1)
    }

    /// Point the chain at a new tip, rebuilding the height vector from the
    /// parent links.
    pub fn set_tip(&mut self, index: &BlockIndex, tip: BlockId) {
        let height = index.entry(tip).height as usize;
        self.chain.resize(height + 1, 0);
        let mut cur = Some(tip);
        let mut h = height;
        while let Some(id) = cur {
            // stop early where the existing chain already agrees
            if self.chain.get(h) == Some(&id) && h != height {
                break;
            }
            self.chain[h] = id;
            cur = index.entry(id).parent;
            if h == 0 {
                break;
            }
            h -= 1;
        }
    }
}

/// Chain state shared by all peer handlers: the header arena, the active
/// chain, and the best-known header.
#[derive(Debug, Default)]
pub struct Chain {
    pub index: BlockIndex,
    pub active: ActiveChain,
    pub best_header: Option<BlockId>,
    ibd_latch: bool,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_genesis(genesis: BlockHeader) -> Self {
        let mut chain = Self::new();
        let id = chain
            .index
            .connect_header(genesis)
            .expect("genesis has no parent");
        chain.index.set_status(id, status::HAVE_DATA);
        chain.active.set_tip(&chain.index, id);
        chain.best_header = Some(id);
        chain
    }

    pub fn tip(&self) -> Option<BlockId> {
        self.active.tip()
    }

    pub fn tip_entry(&self) -> Option<&IndexEntry> {
        self.tip().map(|id| self.index.entry(id))
    }

    /// Track the most-work header seen so far.
    pub fn update_best_header(&mut self, id: BlockId) {
        let work = self.index.entry(id).chain_work;
        match self.best_header {
            Some(best) if self.index.entry(best).chain_work >= work => {}
            _ => self.best_header = Some(id),
        }
    }

    /// First locator hash found on the active chain, else the genesis.
    pub fn find_fork(&self, locator: &BlockLocator) -> Option<BlockId> {
        for hash in &locator.have {
            if let Some(id) = self.index.get(hash) {
                if self.active.contains(&self.index, id) {
                    return Some(id);
                }
            }
        }
        self.active.at_height(0)
    }

    /// Build a locator back from `from` (defaults to the tip): the last ten
    /// hashes, then doubling steps back to the genesis.
    pub fn locator(&self, from: Option<BlockId>) -> BlockLocator {
        let mut have = Vec::new();
        let mut id = match from.or_else(|| self.tip()) {
            Some(id) => id,
            None => return BlockLocator::default(),
        };
        let mut step = 1u64;
        loop {
            have.push(self.index.entry(id).hash);
            let height = self.index.entry(id).height;
            if height == 0 {
                break;
            }
            if have.len() >= 10 {
                step *= 2;
            }
            let target = height.saturating_sub(step);
            // Prefer walking the active chain once we are on it.
            id = if self.active.contains(&self.index, id) {
                match self.active.at_height(target) {
                    Some(a) => a,
                    None => break,
                }
            } else {
                match self.index.ancestor(id, target) {
                    Some(a) => a,
                    None => break,
                }
            };
        }
        BlockLocator { have }
    }

    /// Initial block download: no tip, or a tip older than `max_tip_age`.
    /// Latches off permanently once the node is synced.
    pub fn is_initial_block_download(&mut self, now: u64, max_tip_age: u64) -> bool {
        if self.ibd_latch {
            return false;
        }
        let synced = match self.tip_entry() {
            Some(tip) => (tip.header.time as u64).saturating_add(max_tip_age) > now,
            None => false,
        };
        if synced {
            self.ibd_latch = true;
        }
        !synced
    }

    /// Direct fetch is allowed when the tip is within 20 target spacings of
    /// the present.
    pub fn can_direct_fetch(&self, now: u64, pow_target_spacing: u64) -> bool {
        match self.tip_entry() {
            Some(tip) => (tip.header.time as u64) > now.saturating_sub(pow_target_spacing * 20),
            None => false,
        }
    }

    /// Time-equivalent of the work gap between `from` and the best header,
    /// scaled by the work of one tip-difficulty block.
    pub fn proof_equivalent_seconds(&self, from: BlockId, pow_target_spacing: u64) -> u64 {
        let best = match self.best_header {
            Some(b) => b,
            None => return 0,
        };
        let best_entry = self.index.entry(best);
        let gap = best_entry
            .chain_work
            .saturating_sub(self.index.entry(from).chain_work);
        let per_block = work_from_bits(best_entry.header.bits).max(1);
        ((gap / per_block) as u64).saturating_mul(pow_target_spacing)
    }
}
