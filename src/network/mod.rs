//! Gossip-style peer synchronization over newline-delimited JSON on TCP.
//!
//! ```text
//! A                                   B
//! │  HELLO {nodeId, networkId, v}     │
//! │ <───────────────────────────────> │
//! │  PEERS / CHAIN_SUMMARY            │
//! │ <───────────────────────────────> │
//! │  GET_BLOCKS {fromHeight, max}     │   (A is behind)
//! │ ────────────────────────────────> │
//! │  BLOCK ... BLOCK, CHAIN_SUMMARY   │
//! │ <──────────────────────────────── │
//! │  INV {block, [hash]}              │   (B mined or accepted a block)
//! │ <──────────────────────────────── │
//! ```
//!
//! Blocks are only accepted when they extend the local tip; there is no
//! fork choice. A node facing a competing branch stalls until the other
//! side's chain is strictly longer and fetched in order.

pub mod message;
pub mod peer_book;
pub mod server;
pub mod session;
pub mod sync;

use std::time::Duration;
use uuid::Uuid;

pub use message::{InvType, Message, ProtocolError};
pub use peer_book::{PeerBook, PeerError};
pub use server::Network;

/// Bumped on any incompatible envelope change.
pub const PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_NETWORK_ID: &str = "pharmachain-devnet";

/// Upper bound on a single JSON line.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// `host:port` the acceptor binds to.
    pub listen_addr: String,
    /// Address put in HELLO; defaults to the bound address.
    pub advertise_addr: Option<String>,
    pub node_id: String,
    pub network_id: String,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub connect_timeout: Duration,
    /// Blocks asked for per GET_BLOCKS, and the most served per request.
    pub sync_batch: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6001".to_string(),
            advertise_addr: None,
            node_id: Uuid::new_v4().to_string(),
            network_id: DEFAULT_NETWORK_ID.to_string(),
            bootstrap_peers: Vec::new(),
            max_peers: 8,
            heartbeat_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            sync_batch: 50,
        }
    }
}
