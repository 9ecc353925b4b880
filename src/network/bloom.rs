//! Bloom filters for transaction relevance (SPV peers) and the rolling
//! known-inventory filters.
//!
//! The wire filter follows the classic filterload semantics: murmur3-seeded
//! hash family, size-capped, optional self-updating on matched outputs.

use std::io::Cursor;

use crate::network::protocol::{
    FilterLoadMessage, OutPoint, Transaction, Writer, MAX_BLOOM_FILTER_SIZE, MAX_BLOOM_HASH_FUNCS,
};

/// Filter never updates itself.
pub const BLOOM_UPDATE_NONE: u8 = 0;
/// Matched outputs are inserted so spends of them match too.
pub const BLOOM_UPDATE_ALL: u8 = 1;
/// Like ALL but only for pay-to-pubkey style outputs; we treat it as ALL.
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;

fn murmur(data: &[u8], seed: u32) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(data), seed).unwrap_or(0)
}

/// Seed spacing for the hash family; keeps the functions independent for a
/// shared tweak.
const HASH_SEED_MULTIPLIER: u32 = 0xFBA4_C795;

/// Peer-supplied transaction relevance filter.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    data: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    pub fn from_message(msg: FilterLoadMessage) -> Self {
        Self {
            data: msg.data,
            hash_funcs: msg.hash_funcs,
            tweak: msg.tweak,
            flags: msg.flags,
        }
    }

    /// The empty filter installed by `filterclear`: matches nothing but
    /// marks the peer as filtering.
    pub fn empty() -> Self {
        Self {
            data: Vec::new(),
            hash_funcs: 0,
            tweak: 0,
            flags: BLOOM_UPDATE_NONE,
        }
    }

    /// Caps a remote filter must respect; violations are worth a full
    /// misbehavior score at the call site.
    pub fn is_within_size_constraints(&self) -> bool {
        self.data.len() <= MAX_BLOOM_FILTER_SIZE && self.hash_funcs <= MAX_BLOOM_HASH_FUNCS
    }

    fn bit_index(&self, n: u32, data: &[u8]) -> usize {
        let seed = n
            .wrapping_mul(HASH_SEED_MULTIPLIER)
            .wrapping_add(self.tweak);
        (murmur(data, seed) as usize) % (self.data.len() * 8)
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.data.is_empty() {
            return;
        }
        for n in 0..self.hash_funcs {
            let idx = self.bit_index(n, data);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    pub fn insert_outpoint(&mut self, outpoint: &OutPoint) {
        let mut w = Writer::new();
        w.put_hash(&outpoint.txid);
        w.put_u32(outpoint.index);
        self.insert(&w.freeze());
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        if self.data.is_empty() {
            return false;
        }
        for n in 0..self.hash_funcs {
            let idx = self.bit_index(n, data);
            if self.data[idx >> 3] & (1 << (idx & 7)) == 0 {
                return false;
            }
        }
        true
    }

    fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        let mut w = Writer::new();
        w.put_hash(&outpoint.txid);
        w.put_u32(outpoint.index);
        self.contains(&w.freeze())
    }

    /// Whether a transaction is relevant to this filter: its txid, any data
    /// element pushed by an output script, any spent outpoint, or any data
    /// element pushed by an input script. Matched outputs are inserted when
    /// the update flag asks for it, so future spends keep matching.
    pub fn is_relevant_and_update(&mut self, tx: &Transaction) -> bool {
        if self.data.is_empty() {
            return false;
        }
        let txid = tx.txid();
        let mut found = self.contains(txid.as_bytes());

        for (index, output) in tx.outputs.iter().enumerate() {
            for element in script_push_elements(&output.script_pubkey) {
                if self.contains(element) {
                    found = true;
                    if self.flags != BLOOM_UPDATE_NONE {
                        self.insert_outpoint(&OutPoint {
                            txid,
                            index: index as u32,
                        });
                    }
                    break;
                }
            }
        }
        if found {
            return true;
        }

        for input in &tx.inputs {
            if self.contains_outpoint(&input.prev_out) {
                return true;
            }
            for element in script_push_elements(&input.script_sig) {
                if self.contains(element) {
                    return true;
                }
            }
        }
        false
    }
}

/// Iterate the data elements pushed by a script, skipping non-push opcodes.
/// Malformed trailing pushes are ignored rather than treated as matches.
fn script_push_elements(script: &[u8]) -> Vec<&[u8]> {
    let mut elements = Vec::new();
    let mut i = 0;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            0x01..=0x4b => op as usize,
            0x4c => {
                if i >= script.len() {
                    break;
                }
                let l = script[i] as usize;
                i += 1;
                l
            }
            0x4d => {
                if i + 1 >= script.len() {
                    break;
                }
                let l = u16::from_le_bytes([script[i], script[i + 1]]) as usize;
                i += 2;
                l
            }
            0x4e => {
                if i + 3 >= script.len() {
                    break;
                }
                let l = u32::from_le_bytes([script[i], script[i + 1], script[i + 2], script[i + 3]])
                    as usize;
                i += 4;
                l
            }
            _ => continue,
        };
        if i + len > script.len() {
            break;
        }
        if len > 0 {
            elements.push(&script[i..i + len]);
        }
        i += len;
    }
    elements
}

/// Approximate set of recently seen keys with bounded memory: two
/// generations of hashed entries, the older dropped when the newer fills.
/// Used for per-peer known-inventory and known-address tracking, where a
/// false positive only suppresses a redundant announcement.
#[derive(Debug)]
pub struct RollingBloomFilter {
    current: std::collections::HashSet<u64>,
    previous: std::collections::HashSet<u64>,
    generation_size: usize,
    tweak: u32,
}

impl RollingBloomFilter {
    pub fn new(entries_per_generation: usize, tweak: u32) -> Self {
        Self {
            current: std::collections::HashSet::new(),
            previous: std::collections::HashSet::new(),
            generation_size: entries_per_generation.max(1),
            tweak,
        }
    }

    fn key(&self, data: &[u8]) -> u64 {
        let lo = murmur(data, self.tweak) as u64;
        let hi = murmur(data, self.tweak.wrapping_add(1)) as u64;
        (hi << 32) | lo
    }

    pub fn insert(&mut self, data: &[u8]) {
        if self.current.len() >= self.generation_size {
            self.previous = std::mem::take(&mut self.current);
        }
        let key = self.key(data);
        self.current.insert(key);
    }

    pub fn contains(&self, data: &[u8]) -> bool {
        let key = self.key(data);
        self.current.contains(&key) || self.previous.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::{Hash256, TxIn, TxOut};

    fn filter(bytes: usize) -> BloomFilter {
        BloomFilter::from_message(FilterLoadMessage {
            data: vec![0u8; bytes],
            hash_funcs: 5,
            tweak: 0xdead_beef,
            flags: BLOOM_UPDATE_ALL,
        })
    }

    #[test]
    fn test_insert_then_contains() {
        let mut f = filter(256);
        let key = Hash256::from_byte(3);
        assert!(!f.contains(key.as_bytes()));
        f.insert(key.as_bytes());
        assert!(f.contains(key.as_bytes()));
    }

    #[test]
    fn test_size_constraints() {
        assert!(filter(MAX_BLOOM_FILTER_SIZE).is_within_size_constraints());
        assert!(!filter(MAX_BLOOM_FILTER_SIZE + 1).is_within_size_constraints());
        let mut too_many = filter(64);
        too_many.hash_funcs = MAX_BLOOM_HASH_FUNCS + 1;
        assert!(!too_many.is_within_size_constraints());
    }

    #[test]
    fn test_relevance_by_output_script_and_update() {
        let pubkey_hash = [0xabu8; 20];
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&pubkey_hash);
        script.extend_from_slice(&[0x88, 0xac]);

        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![TxOut {
                value: 1,
                script_pubkey: script,
            }],
            lock_time: 0,
        };

        let mut f = filter(512);
        f.insert(&pubkey_hash);
        assert!(f.is_relevant_and_update(&tx));

        // The matched output was inserted, so spending it now matches too.
        let spend = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_out: OutPoint {
                    txid: tx.txid(),
                    index: 0,
                },
                script_sig: vec![],
                sequence: 0,
            }],
            outputs: vec![],
            lock_time: 0,
        };
        assert!(f.is_relevant_and_update(&spend));
    }

    #[test]
    fn test_empty_filter_matches_nothing() {
        let mut f = BloomFilter::empty();
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
        };
        assert!(!f.is_relevant_and_update(&tx));
        assert!(!f.contains(b"anything"));
    }

    #[test]
    fn test_rolling_filter_forgets_old_generations() {
        let mut f = RollingBloomFilter::new(4, 7);
        f.insert(b"a");
        assert!(f.contains(b"a"));
        // Fill two full generations past "a".
        for i in 0..9u8 {
            f.insert(&[i]);
        }
        assert!(!f.contains(b"a"));
    }

    #[test]
    fn test_script_push_elements_handles_truncated_pushes() {
        // PUSHDATA1 claiming more bytes than remain.
        assert!(script_push_elements(&[0x4c, 0x20, 0x01]).is_empty());
        // Direct push of 2 bytes then an opcode.
        let elems = script_push_elements(&[0x02, 0xaa, 0xbb, 0xac]);
        assert_eq!(elems, vec![&[0xaa, 0xbb][..]]);
    }
}
