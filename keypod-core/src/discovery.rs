//! Discovery merge: one keyed map fed by two advertisement mechanisms.
//!
//! Both mechanisms report `found`, `resolved` and `removed` events for the same service. Resolved
//! advertisements are upserted under their dedup key (`name|host|port`) so the same endpoint seen
//! twice is one entry. Removal is by name prefix, so either mechanism can withdraw an entry the
//! other one produced. A `.local` host name supersedes an IP literal for the same name and port.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::LOCAL_DOMAIN_SUFFIX;

pub fn dedup_key(name: &str, host: &str, port: u16) -> String {
    format!("{name}|{host}|{port}")
}

/// A resolved advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub dedup_key: String,
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl DiscoveredPeer {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let host = host.into();
        Self {
            dedup_key: dedup_key(&name, &host, port),
            name,
            host,
            port,
        }
    }

    /// Host is a multicast-DNS name (`*.local`, optionally with the trailing root dot).
    pub fn is_local_host(&self) -> bool {
        let host = self.host.trim_end_matches('.').to_ascii_lowercase();
        host.ends_with(LOCAL_DOMAIN_SUFFIX)
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>().is_ok()
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn endpoint(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// The two independent advertisement mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    /// Passive: periodic multicast advertisements.
    Advertisements,
    /// Active: multicast queries answered by unicast responses.
    Browse,
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mechanism::Advertisements => "adverts",
            Mechanism::Browse => "browse",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// Advertisement seen, host/port not known yet.
    Found { name: String },
    Resolved { name: String, host: String, port: u16 },
    /// Advertisement seen but could not be resolved. It is dropped, not retried.
    ResolveFailed { name: String, reason: String },
    Removed { name: String },
}

/// Deduplicated view of both mechanisms.
#[derive(Debug, Default)]
pub struct PeerMap {
    entries: HashMap<String, DiscoveredPeer>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns whether the resolved set changed.
    pub fn apply(&mut self, mechanism: Mechanism, event: DiscoveryEvent) -> bool {
        match event {
            DiscoveryEvent::Found { name } => {
                debug!(%mechanism, name = %name, "advertisement found");
                false
            }
            DiscoveryEvent::Resolved { name, host, port } => self.upsert(DiscoveredPeer::new(name, host, port)),
            DiscoveryEvent::ResolveFailed { name, reason } => {
                warn!(%mechanism, name = %name, reason = %reason, "advertisement could not be resolved");
                self.remove_advertisement(&name) > 0
            }
            DiscoveryEvent::Removed { name } => {
                debug!(%mechanism, name = %name, "advertisement removed");
                self.remove_advertisement(&name) > 0
            }
        }
    }

    /// Insert or replace `peer`. Idempotent: re-resolving the same endpoint changes nothing.
    pub fn upsert(&mut self, peer: DiscoveredPeer) -> bool {
        if peer.name.contains('|') {
            warn!(name = %peer.name, "advertisement name contains '|', ignored");
            return false;
        }
        if self.entries.get(&peer.dedup_key) == Some(&peer) {
            return false;
        }
        let aliases: Vec<&DiscoveredPeer> = self
            .entries
            .values()
            .filter(|e| e.name == peer.name && e.port == peer.port && e.host != peer.host)
            .collect();
        if peer.is_ip_literal() && aliases.iter().any(|e| e.is_local_host()) {
            return false;
        }
        if peer.is_local_host() {
            let stale: Vec<String> = aliases
                .iter()
                .filter(|e| e.is_ip_literal())
                .map(|e| e.dedup_key.clone())
                .collect();
            for key in stale {
                self.entries.remove(&key);
            }
        }
        self.entries.insert(peer.dedup_key.clone(), peer);
        true
    }

    /// Remove every entry whose key starts with `"{name}|"`. Returns how many were removed.
    pub fn remove_advertisement(&mut self, name: &str) -> usize {
        let prefix = format!("{name}|");
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        before - self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&DiscoveredPeer> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by name, then dedup key.
    pub fn snapshot(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self.entries.values().cloned().collect();
        sort_peers(&mut peers);
        peers
    }
}

pub fn sort_peers(peers: &mut [DiscoveredPeer]) {
    peers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.dedup_key.cmp(&b.dedup_key)));
}

/// Pick one peer from a sorted snapshot: the first `.local` host, else the first entry.
pub fn preferred(peers: &[DiscoveredPeer]) -> Option<&DiscoveredPeer> {
    peers
        .iter()
        .find(|p| p.is_local_host())
        .or_else(|| peers.first())
}
