//! Ember Node - peer message processing and block synchronization core
//!
//! This crate implements the P2P heart of an Ember full node: it ingests
//! framed peer messages, drives header and block synchronization, services
//! peer requests for blocks and transactions, and feeds new data into the
//! downstream validation and mempool layers.
//!
//! ## What lives here
//!
//! 1. Per-peer protocol state machines (handshake, headers sync, inventory
//!    relay, ping/pong, bloom filtering)
//! 2. A multi-peer request scheduler with in-flight tracking and timeouts
//! 3. Adversarial input handling: size caps, misbehavior scoring, ban logic
//! 4. The periodic per-peer send loop (announcements, addr gossip, pings)
//!
//! ## What does not
//!
//! Consensus validation, the mempool implementation, block storage, and the
//! raw socket layer are external collaborators, consumed through the traits
//! in [`network`]. The network layer injects them at startup and hands us
//! decoded message envelopes; we hand back queued outbound messages.

// Allow dead code - many fields/functions are part of the API or for future use
#![allow(dead_code)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::large_enum_variant)]

pub mod chain;
pub mod config;
pub mod network;
pub mod utils;

pub use config::{ChainParams, Network, NodeConfig};
pub use network::NetContext;
