use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

/// Maps any socket address into the IPv6 space, IPv4 becoming v4-mapped
pub fn to_v6(addr: SocketAddr) -> SocketAddrV6 {
    match addr {
        SocketAddr::V6(v6) => v6,
        SocketAddr::V4(v4) => SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0),
    }
}

/// A known peer as reported by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub address: String,
    pub last_seen: DateTime<Utc>,
}

/// Concurrent set of peers keyed by endpoint, each with the time it was last heard from
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Arc<DashMap<SocketAddrV6, DateTime<Utc>>>,
    local: Option<SocketAddrV6>,
}

impl PeerTable {
    /// Creates an empty table that never records `local`
    pub fn new(local: Option<SocketAddrV6>) -> Self {
        PeerTable {
            peers: Arc::new(DashMap::new()),
            local,
        }
    }

    /// Records `peer` as seen now
    ///
    /// # Returns
    ///
    /// `true` if the peer was not known before
    pub fn insert(&self, peer: SocketAddrV6) -> bool {
        self.insert_at(peer, Utc::now())
    }

    pub fn insert_at(&self, peer: SocketAddrV6, seen: DateTime<Utc>) -> bool {
        if !self.is_usable(&peer) {
            return false;
        }
        self.peers.insert(peer, seen).is_none()
    }

    fn is_usable(&self, peer: &SocketAddrV6) -> bool {
        if peer.port() == 0 || peer.ip().is_unspecified() {
            return false;
        }
        match self.local {
            Some(local) => local != *peer,
            None => true,
        }
    }

    pub fn contains(&self, peer: &SocketAddrV6) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn remove(&self, peer: &SocketAddrV6) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All known peers in no particular order
    pub fn peers(&self) -> Vec<SocketAddrV6> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    /// Known peers with their last-seen time, most recent first
    pub fn list(&self) -> Vec<PeerInfo> {
        let mut list: Vec<PeerInfo> = self
            .peers
            .iter()
            .map(|entry| PeerInfo {
                address: entry.key().to_string(),
                last_seen: *entry.value(),
            })
            .collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        list
    }

    /// Picks up to `count` distinct peers at random
    pub fn random_sample(&self, count: usize) -> Vec<SocketAddrV6> {
        let mut rng = rand::thread_rng();
        self.peers
            .iter()
            .map(|entry| *entry.key())
            .choose_multiple(&mut rng, count)
    }

    /// Drops every peer last seen before `cutoff`
    ///
    /// # Returns
    ///
    /// The number of peers removed
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.peers.len();
        self.peers.retain(|_, seen| *seen >= cutoff);
        before.saturating_sub(self.peers.len())
    }
}
