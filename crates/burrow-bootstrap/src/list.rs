//! In-memory bootstrap list: validated addresses under one canonical peer id.

use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::time::Duration;

use crate::address::{compare, AddressRecord, BootstrapAddress, Latency};

/// How a candidate's peer id relates to the list's canonical id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// No canonical id yet.
    Unset,
    Matches,
    Conflicts { current: PeerId },
}

#[derive(Debug)]
pub struct BootstrapList {
    addresses: HashMap<String, BootstrapAddress>,
    server_id: Option<PeerId>,
    stale_window: Duration,
    limit: usize,
}

impl BootstrapList {
    pub fn new(stale_window: Duration, limit: usize) -> Self {
        Self {
            addresses: HashMap::new(),
            server_id: None,
            stale_window,
            limit,
        }
    }

    pub fn server_id(&self) -> Option<PeerId> {
        self.server_id
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.addresses.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&BootstrapAddress> {
        self.addresses.get(key)
    }

    pub fn stale_window(&self) -> Duration {
        self.stale_window
    }

    pub fn identity_of(&self, addr: &BootstrapAddress) -> Identity {
        match self.server_id {
            None => Identity::Unset,
            Some(id) if id == addr.server_id() => Identity::Matches,
            Some(current) => Identity::Conflicts { current },
        }
    }

    /// Insert an address that agrees with the canonical id, adopting its id if
    /// none is set. Returns false if the address conflicts or is already known.
    pub fn insert(&mut self, addr: BootstrapAddress) -> bool {
        if let Identity::Conflicts { .. } = self.identity_of(&addr) {
            return false;
        }
        let key = addr.key();
        if self.addresses.contains_key(&key) {
            return false;
        }
        self.server_id.get_or_insert(addr.server_id());
        self.addresses.insert(key, addr);
        true
    }

    /// Replace the canonical id and rewrite every stored address to it.
    /// Returns the previous id.
    pub fn override_identity(&mut self, id: PeerId) -> Option<PeerId> {
        let previous = self.server_id.replace(id);
        if previous == Some(id) {
            return previous;
        }
        let rewritten: HashMap<String, BootstrapAddress> = self
            .addresses
            .drain()
            .map(|(_, mut addr)| {
                addr.set_server_id(id);
                (addr.key(), addr)
            })
            .collect();
        self.addresses = rewritten;
        previous
    }

    /// Apply a probe result to a known address.
    pub fn observe(&mut self, key: &str, latency: Option<Duration>, now_ms: i64) {
        if let Some(addr) = self.addresses.get_mut(key) {
            addr.observe(latency, now_ms);
        }
    }

    /// Drop addresses not seen within the staleness window. Returns the keys
    /// removed.
    pub fn evict_stale(&mut self, now_ms: i64) -> Vec<String> {
        let window = self.stale_window;
        let stale: Vec<String> = self
            .addresses
            .iter()
            .filter(|(_, a)| !a.is_recent(now_ms, window))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.addresses.remove(key);
        }
        stale
    }

    /// Every address in dial preference order.
    pub fn sorted(&self) -> Vec<&BootstrapAddress> {
        let mut all: Vec<&BootstrapAddress> = self.addresses.values().collect();
        all.sort_by(|a, b| compare(Some(a), Some(b)));
        all
    }

    /// The best `limit` addresses in dial preference order.
    pub fn ranked(&self) -> Vec<&BootstrapAddress> {
        let mut all = self.sorted();
        all.truncate(self.limit);
        all
    }

    pub fn ranked_multiaddrs(&self) -> Vec<Multiaddr> {
        self.ranked().into_iter().map(|a| a.multiaddr().clone()).collect()
    }

    pub fn all_multiaddrs(&self) -> Vec<Multiaddr> {
        self.sorted().into_iter().map(|a| a.multiaddr().clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<BootstrapAddress> {
        self.sorted().into_iter().cloned().collect()
    }

    pub fn records(&self) -> Vec<AddressRecord> {
        self.sorted().into_iter().map(BootstrapAddress::record).collect()
    }

    /// Lowest finite latency across the list.
    pub fn best_latency(&self) -> Option<Duration> {
        self.addresses
            .values()
            .filter_map(|a| match a.latency {
                Latency::Reachable(d) => Some(d),
                _ => None,
            })
            .min()
    }
}
