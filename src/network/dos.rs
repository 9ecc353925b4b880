//! Misbehavior scoring and address bans.
//!
//! Every handler that detects a protocol violation reports it here. Points
//! accumulate on the peer; crossing the threshold bans the remote address
//! and flags the connection for disconnect. Whitelisted peers accumulate
//! points but are never banned or disconnected for them.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::network::peer::Peer;

/// Misbehavior score at which a peer is banned.
pub const BAN_THRESHOLD: i32 = 100;

/// Why an address was banned, for operator visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    NodeMisbehaving,
    InvalidEnvelope,
    ManuallyAdded,
}

#[derive(Debug, Clone)]
struct BanEntry {
    reason: BanReason,
    until: u64,
}

/// Per-address connection history, used by the eviction logic when peers
/// fail the handshake repeatedly.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionHistory {
    pub evictions: u32,
    pub last_eviction_time: u64,
}

/// Tracks misbehavior, bans and handshake evictions.
pub struct DosManager {
    banned: Mutex<HashMap<IpAddr, BanEntry>>,
    connection_history: Mutex<HashMap<IpAddr, ConnectionHistory>>,
    /// Default ban duration, seconds.
    ban_time: u64,
}

impl DosManager {
    pub fn new(ban_time: u64) -> Self {
        Self {
            banned: Mutex::new(HashMap::new()),
            connection_history: Mutex::new(HashMap::new()),
            ban_time,
        }
    }

    /// Add misbehavior points to a peer. Crossing the threshold bans the
    /// address for the default duration and sets the disconnect flag.
    /// Returns true if the peer was banned by this call.
    pub fn misbehaving(&self, peer: &Peer, points: i32, now: u64) -> bool {
        if points <= 0 {
            return false;
        }
        let score = peer.misbehavior.fetch_add(points, Ordering::AcqRel) + points;
        if score >= BAN_THRESHOLD && score - points < BAN_THRESHOLD {
            if peer.whitelisted {
                warn!(
                    peer = %peer.log_name(),
                    score, "whitelisted peer crossed ban threshold, not banning"
                );
                return false;
            }
            warn!(peer = %peer.log_name(), score, "ban threshold reached, banning");
            self.ban(peer.addr.ip(), BanReason::NodeMisbehaving, self.ban_time, now);
            peer.set_disconnect();
            return true;
        }
        debug!(peer = %peer.log_name(), points, score, "misbehaving");
        false
    }

    /// Ban an address for `duration` seconds.
    pub fn ban(&self, ip: IpAddr, reason: BanReason, duration: u64, now: u64) {
        self.banned.lock().insert(
            ip,
            BanEntry {
                reason,
                until: now + duration,
            },
        );
    }

    pub fn is_banned(&self, ip: IpAddr, now: u64) -> bool {
        match self.banned.lock().get(&ip) {
            Some(entry) => entry.until > now,
            None => false,
        }
    }

    pub fn unban(&self, ip: IpAddr) {
        self.banned.lock().remove(&ip);
    }

    /// Drop expired entries; run periodically.
    pub fn sweep_expired(&self, now: u64) -> usize {
        let mut banned = self.banned.lock();
        let before = banned.len();
        banned.retain(|_, entry| entry.until > now);
        before - banned.len()
    }

    /// Record a handshake eviction (e.g. verack timeout) against the
    /// address, feeding the connection-slot algorithm.
    pub fn record_eviction(&self, ip: IpAddr, now: u64) {
        let mut history = self.connection_history.lock();
        let entry = history.entry(ip).or_default();
        entry.evictions += 1;
        entry.last_eviction_time = now;
    }

    pub fn connection_history(&self, ip: IpAddr) -> ConnectionHistory {
        self.connection_history
            .lock()
            .get(&ip)
            .copied()
            .unwrap_or_default()
    }
}
