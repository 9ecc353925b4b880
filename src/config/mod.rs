//! Configuration for the peer subsystem.
//!
//! Handles configuration loading, validation, and per-network chain
//! parameters. Values not present in a config file fall back to the same
//! defaults mainnet nodes ship with.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which chain this node follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Testnet,
    Regtest,
}

impl Network {
    /// Network magic prepended to every framed message.
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Network::Main => [0xf9, 0xbe, 0xb4, 0xd9],
            Network::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Network::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
        }
    }
}

/// Consensus-adjacent parameters the peer layer needs. Everything that
/// actually validates blocks lives behind the collaborator traits; these are
/// only the timing and serving knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainParams {
    /// Chain selector.
    pub network: Network,

    /// Target seconds between blocks.
    #[serde(default = "default_pow_target_spacing")]
    pub pow_target_spacing: u64,

    /// Tip older than this counts as initial block download.
    #[serde(default = "default_max_tip_age")]
    pub max_tip_age: u64,

    /// Minimum number of recent blocks a pruning node keeps on disk.
    #[serde(default = "default_min_blocks_to_keep")]
    pub min_blocks_to_keep: u64,
}

fn default_pow_target_spacing() -> u64 {
    600
}

fn default_max_tip_age() -> u64 {
    24 * 60 * 60
}

fn default_min_blocks_to_keep() -> u64 {
    288
}

impl ChainParams {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            pow_target_spacing: default_pow_target_spacing(),
            max_tip_age: default_max_tip_age(),
            min_blocks_to_keep: default_min_blocks_to_keep(),
        }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.network.magic()
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::new(Network::Main)
    }
}

/// Node-level behavior configuration for the peer subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Advertised user agent, sanitized before logging either way.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Port we tell peers to reach us on (also carried in the extension
    /// handshake for expedited forwarding).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Service bits we advertise in our version message.
    #[serde(default = "default_services")]
    pub services: u64,

    /// Whether we accept a listening socket at all; governs local address
    /// advertising.
    #[serde(default = "default_true")]
    pub listen: bool,

    /// Relay no transactions, only blocks.
    #[serde(default = "default_false")]
    pub blocks_only: bool,

    /// Let whitelisted peers relay transactions even in blocks-only mode.
    #[serde(default = "default_true")]
    pub whitelist_relay: bool,

    /// Per-peer outbound buffer cap in bytes. Serving stops for a peer whose
    /// queued bytes reach this; double it and the peer earns misbehavior.
    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,

    /// Optional rolling 24h outbound byte budget. When reached, historical
    /// and filtered block requests disconnect non-whitelisted peers.
    #[serde(default)]
    pub max_outbound_bytes_per_day: Option<u64>,

    /// Maximum blocks requested in parallel from one peer.
    #[serde(default = "default_max_blocks_in_transit")]
    pub max_blocks_in_transit_per_peer: usize,

    /// How far past the tip block downloads may run ahead.
    #[serde(default = "default_block_download_window")]
    pub block_download_window: u64,

    /// Seconds to wait for a verack after sending our version.
    #[serde(default = "default_verack_timeout")]
    pub verack_timeout: u64,

    /// Seconds to wait for the first headers batch after starting sync.
    #[serde(default = "default_initial_headers_timeout")]
    pub initial_headers_timeout: u64,

    /// Disconnect a sync peer whose first headers batch never arrived in
    /// time. The legacy implementation only logged here; disconnecting is a
    /// deliberate change, so it stays configurable.
    #[serde(default = "default_true")]
    pub disconnect_on_header_timeout: bool,

    /// Whether this node prunes old blocks (limits getblocks serving).
    #[serde(default = "default_false")]
    pub prune_mode: bool,

    /// Hours an address ban lasts when misbehavior crosses the threshold.
    #[serde(default = "default_ban_time")]
    pub ban_time_seconds: u64,

    /// Whether this node can open IPv6 connections. Addresses on networks
    /// we cannot reach are relayed to fewer peers and not stored.
    #[serde(default = "default_false")]
    pub reachable_ipv6: bool,
}

fn default_user_agent() -> String {
    "/Ember:0.4.0/".to_string()
}

fn default_listen_port() -> u16 {
    8343
}

fn default_services() -> u64 {
    crate::network::protocol::NODE_NETWORK | crate::network::protocol::NODE_BLOOM
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_send_buffer_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_blocks_in_transit() -> usize {
    16
}

fn default_block_download_window() -> u64 {
    1024
}

fn default_verack_timeout() -> u64 {
    60
}

fn default_initial_headers_timeout() -> u64 {
    120
}

fn default_ban_time() -> u64 {
    24 * 60 * 60
}

impl Default for NodeConfig {
    fn default() -> Self {
        // serde defaults and Default must agree; both route through the
        // default_* helpers.
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file, filling gaps with defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: NodeConfig = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_buffer_size == 0 {
            anyhow::bail!("send_buffer_size must be nonzero");
        }
        if self.max_blocks_in_transit_per_peer == 0 {
            anyhow::bail!("max_blocks_in_transit_per_peer must be nonzero");
        }
        Ok(())
    }

    /// Whether an address lives on a network we can actually connect to.
    /// Distinct from routability: a globally routable IPv6 address is still
    /// unreachable from a v4-only node.
    pub fn is_reachable(&self, addr: &crate::network::protocol::NetAddress) -> bool {
        addr.is_ipv4() || self.reachable_ipv6
    }
}
