//! Core constants and data types for the DHT node.
//!
//! Identifiers are 160-bit values, carried on the wire as 20 raw bytes and
//! held in memory as their 40-character lowercase hex form. Distances between
//! identifiers use a reduced metric: `40 - commonHexPrefixLength(a, b)`,
//! a coarse hex-nibble bucket counter rather than the full XOR metric.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

// =============================================================================
// IDENTIFIERS AND DISTANCES
// =============================================================================

/// Length of a node id / info hash in hex characters (160 bits).
pub const ID_HEX_LEN: usize = 40;

/// Minimum allowed prefix distance between a sender and the local id.
/// Senders sharing more than 10 leading nibbles with us are treated as
/// impersonation attempts and blocked.
pub const MIN_SENDER_DISTANCE: u32 = 30;

/// Maximum prefix distance for unconditional routing table admission.
/// Keeps the table concentrated in the four-nibble neighborhood of the
/// local id.
pub const MAX_STORED_DISTANCE: u32 = 36;

/// Below this table size, nodes are admitted regardless of distance.
/// Lets the table bootstrap from arbitrarily distant seeds.
pub const MIN_TABLE_NODES: usize = 7;

/// Maximum number of nodes returned by a closest-nodes lookup.
pub const MAX_CLOSEST_NODES: usize = 7;

// =============================================================================
// FRESHNESS THRESHOLDS
// =============================================================================

/// Nodes not heard from for this long are questionable (ping candidates).
pub const QUESTIONABLE_AFTER_SECS: u64 = 5 * 60;

/// Nodes not heard from for this long are unresponsive (delete candidates).
pub const UNRESPONSIVE_AFTER_SECS: u64 = 15 * 60;

/// Steady-state maintenance cycle: ping questionable nodes, then drop
/// unresponsive ones. Together with the thresholds above this probes a node
/// once and prunes it on the next cycle if no response arrived.
pub const MAINTENANCE_INTERVAL_SECS: u64 = 300;

// =============================================================================
// BOOTSTRAP
// =============================================================================

/// Number of find_node rounds fired after seeding an empty table.
pub const BOOTSTRAP_ROUNDS: u32 = 10;

/// Delay between bootstrap rounds.
pub const BOOTSTRAP_ROUND_DELAY_SECS: u64 = 5;

/// Well-known bootstrap node id (router.bittorrent.com). Resolved statically,
/// never via DNS.
pub const BOOTSTRAP_NODE_ID: &str = "32f54e697351ff4aec29cdbaabf2fbe3467cc267";

/// Well-known bootstrap node address.
pub const BOOTSTRAP_NODE_IP: Ipv4Addr = Ipv4Addr::new(67, 215, 246, 10);

/// Well-known bootstrap node port.
pub const BOOTSTRAP_NODE_PORT: u16 = 6881;

// =============================================================================
// WIRE AND SOCKET LIMITS
// =============================================================================

/// Largest UDP datagram we will receive.
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Socket receive timeout; the receive loop re-checks the stop signal on
/// every expiry.
pub const RECV_TIMEOUT_SECS: u64 = 1;

/// Compact node info record size (BEP 5): id(20) | ip(4) | port(2).
pub const COMPACT_NODE_LEN: usize = 26;

/// Compact peer info record size: ip(4) | port(2).
pub const COMPACT_PEER_LEN: usize = 6;

/// Length of generated transaction ids and announce tokens.
pub const TRANSACTION_ID_LEN: usize = 2;

/// How long a misbehaving source IP stays blocked.
pub const BLOCK_DURATION_SECS: u64 = 24 * 3600;

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Prefix distance between two hex identifiers: 40 minus the length of their
/// common hex prefix. Range 0..=40.
pub fn prefix_distance(id_1: &str, id_2: &str) -> u32 {
    let common = id_1
        .bytes()
        .zip(id_2.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    ID_HEX_LEN.saturating_sub(common) as u32
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors surfaced by the node. None of them are fatal to a running node:
/// handler failures are logged and the receive loop keeps going.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid hex identifier: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("missing or malformed field: {0}")]
    Field(&'static str),

    #[error("node already started")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// =============================================================================
// DATA TYPES
// =============================================================================

/// A DHT node as seen on the wire. Transient, constructed per inbound
/// message; a read-only view with no relation to any stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// 40-char lowercase hex id.
    pub id: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Node {
    pub fn new(id: impl Into<String>, ip: Ipv4Addr, port: u16) -> Self {
        Self { id: id.into(), ip, port }
    }

    /// Compact node info (BEP 5): 20 id bytes, 4 ip octets, port big-endian.
    pub fn compact_info(&self) -> Result<Vec<u8>, NodeError> {
        let mut out = Vec::with_capacity(COMPACT_NODE_LEN);
        out.extend_from_slice(&hex::decode(&self.id)?);
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
        Ok(out)
    }

    /// Whether this node may interact with us: routable address, well-formed
    /// id, and not suspiciously close to the local id.
    pub fn is_valid(&self, base_id: &str) -> bool {
        if self.ip.is_unspecified() {
            debug!("Invalid node, ip {}", self.ip);
            return false;
        }
        if self.port == 0 {
            debug!("Invalid node, port {}", self.port);
            return false;
        }
        if self.id.len() != ID_HEX_LEN {
            debug!("Invalid node, id {}", self.id);
            return false;
        }
        if self.id != base_id {
            let distance = prefix_distance(&self.id, base_id);
            if distance < MIN_SENDER_DISTANCE {
                debug!("Invalid node, distance {}", distance);
                return false;
            }
        }
        true
    }
}

/// A torrent peer announced through a node. Identity is the whole triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    /// 40-char lowercase hex info hash.
    pub info_hash: String,
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    /// Compact peer info: 4 ip octets, port big-endian.
    pub fn compact_info(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COMPACT_PEER_LEN);
        out.extend_from_slice(&self.ip.octets());
        out.extend_from_slice(&self.port.to_be_bytes());
        out
    }
}

/// A node admitted to the routing table, together with its bookkeeping.
#[derive(Debug, Clone)]
pub struct StoredNode {
    pub node: Node,
    /// When the node was admitted (unix seconds).
    pub added: u64,
    /// Last two-way communication, if any.
    pub communicated: Option<u64>,
    /// Prefix distance from the local id, fixed at admission.
    pub distance: u32,
    /// Peers announced through this node.
    pub peers: HashSet<Peer>,
}

impl StoredNode {
    /// Reference time for freshness checks: last communication, falling back
    /// to the admission time.
    fn last_contact(&self) -> u64 {
        self.communicated.unwrap_or(self.added)
    }

    /// Not heard from for over 5 minutes; eligible for a ping probe.
    pub fn is_questionable(&self) -> bool {
        now() > self.last_contact() + QUESTIONABLE_AFTER_SECS
    }

    /// Not heard from for over 15 minutes; eligible for deletion.
    pub fn is_unresponsive(&self) -> bool {
        now() > self.last_contact() + UNRESPONSIVE_AFTER_SECS
    }

    pub fn compact_info(&self) -> Result<Vec<u8>, NodeError> {
        self.node.compact_info()
    }
}
