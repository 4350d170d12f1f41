//! The IP-to-identity cache.
//!
//! Maps individual addresses to security identities. Entries are owned by
//! the source that created them; an update from a different source is
//! refused so that kvstore- and agent-derived entries are never clobbered by
//! orchestrator events.

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::net::IpAddr;

/// A numeric security identity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity(pub u32);

impl Identity {
    /// The local host.
    pub const HOST: Identity = Identity(1);

    /// Any workload in the cluster.
    pub const CLUSTER: Identity = Identity(3);
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where an ipcache entry was learned from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Source {
    Kubernetes,
    Kvstore,
    Agent,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IpIdentity {
    pub identity: Identity,
    pub host_ip: IpAddr,
    pub source: Source,
}

#[derive(Default)]
pub struct IpIdentityCache {
    entries: Mutex<HashMap<IpAddr, IpIdentity>>,
}

// === impl IpIdentityCache ===

impl IpIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates an entry. Returns `false`, leaving the entry
    /// untouched, when it is owned by a different source.
    pub fn upsert(&self, ip: IpAddr, host_ip: IpAddr, identity: Identity, source: Source) -> bool {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&ip) {
            if existing.source != source {
                return false;
            }
        }
        entries.insert(
            ip,
            IpIdentity {
                identity,
                host_ip,
                source,
            },
        );
        true
    }

    pub fn lookup(&self, ip: &IpAddr) -> Option<IpIdentity> {
        self.entries.lock().get(ip).copied()
    }

    pub fn delete(&self, ip: &IpAddr) -> bool {
        self.entries.lock().remove(ip).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn upsert_respects_source_ownership() {
        let cache = IpIdentityCache::new();
        assert!(cache.upsert(
            ip("10.1.0.7"),
            ip("10.0.0.2"),
            Identity::CLUSTER,
            Source::Kubernetes
        ));

        // A kvstore entry takes over only by explicit delete; the kubernetes
        // update is refused once another source owns the address.
        assert!(!cache.upsert(ip("10.1.0.7"), ip("10.0.0.2"), Identity::CLUSTER, Source::Kvstore));
        assert!(cache.upsert(
            ip("10.1.0.7"),
            ip("10.0.0.9"),
            Identity::CLUSTER,
            Source::Kubernetes
        ));
        assert_eq!(
            cache.lookup(&ip("10.1.0.7")).unwrap().host_ip,
            ip("10.0.0.9")
        );
    }

    #[test]
    fn delete_removes_entry() {
        let cache = IpIdentityCache::new();
        cache.upsert(ip("10.2.0.1"), ip("10.0.0.3"), Identity::HOST, Source::Kubernetes);
        assert!(cache.delete(&ip("10.2.0.1")));
        assert!(!cache.delete(&ip("10.2.0.1")));
        assert!(cache.lookup(&ip("10.2.0.1")).is_none());
    }
}
