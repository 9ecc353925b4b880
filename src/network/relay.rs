//! Short-lived transaction relay memory.
//!
//! Transactions we have announced recently are kept here so `getdata`
//! replies do not depend on the transaction still sitting in the mempool.
//! Entries expire after a fixed window and are swept opportunistically.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::network::protocol::{Hash256, Transaction};

/// How long a relayed transaction stays servable, seconds.
pub const RELAY_EXPIRY_SECONDS: u64 = 15 * 60;

struct RelayEntry {
    tx: Transaction,
    expires_at: u64,
}

/// Map from txid to recently relayed transaction body.
pub struct RelayMap {
    entries: Mutex<HashMap<Hash256, RelayEntry>>,
}

impl RelayMap {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, tx: Transaction, now: u64) {
        let txid = tx.txid();
        self.entries.lock().insert(
            txid,
            RelayEntry {
                tx,
                expires_at: now + RELAY_EXPIRY_SECONDS,
            },
        );
    }

    pub fn get(&self, txid: &Hash256, now: u64) -> Option<Transaction> {
        let entries = self.entries.lock();
        entries
            .get(txid)
            .filter(|e| e.expires_at > now)
            .map(|e| e.tx.clone())
    }

    pub fn contains(&self, txid: &Hash256, now: u64) -> bool {
        self.get(txid, now).is_some()
    }

    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RelayMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(lock_time: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time,
        }
    }

    #[test]
    fn test_relay_roundtrip_and_expiry() {
        let relay = RelayMap::new();
        let t = tx(1);
        let txid = t.txid();
        relay.insert(t, 1000);
        assert!(relay.contains(&txid, 1000));
        assert!(!relay.contains(&txid, 1000 + RELAY_EXPIRY_SECONDS + 1));
        assert_eq!(relay.sweep_expired(1000 + RELAY_EXPIRY_SECONDS + 1), 1);
        assert!(relay.is_empty());
    }
}
