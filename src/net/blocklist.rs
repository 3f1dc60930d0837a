//! Time-limited blocklist for misbehaving source addresses.
//!
//! Senders that fail validation get their IP inserted here; datagrams from a
//! blocked IP are dropped before decoding until the entry expires.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::debug;

use super::types::{now, BLOCK_DURATION_SECS};

/// IP -> insertion time (unix seconds). Entries expire after 24 hours;
/// expired entries are swept out on the next insert.
#[derive(Debug, Default)]
pub struct Blocklist {
    blocked: HashMap<Ipv4Addr, u64>,
}

impl Blocklist {
    pub fn new() -> Self {
        Self { blocked: HashMap::new() }
    }

    /// Block an address for the next 24 hours.
    pub fn insert(&mut self, ip: Ipv4Addr) {
        self.sweep_expired();
        debug!("Blocking {}", ip);
        self.blocked.insert(ip, now());
    }

    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        match self.blocked.get(ip) {
            Some(blocked_at) => now() < blocked_at + BLOCK_DURATION_SECS,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }

    fn sweep_expired(&mut self) {
        let cutoff = now().saturating_sub(BLOCK_DURATION_SECS);
        self.blocked.retain(|_, blocked_at| *blocked_at > cutoff);
    }

    #[cfg(test)]
    fn insert_at(&mut self, ip: Ipv4Addr, blocked_at: u64) {
        self.blocked.insert(ip, blocked_at);
    }
}
