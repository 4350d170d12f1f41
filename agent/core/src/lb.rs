//! Load-balancer service types and the datapath programming interface.

use ahash::AHashMap as HashMap;
use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

/// Identifier allocated for a frontend; `0` signals "needs allocation".
pub type ServiceId = u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum L4Proto {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

/// A protocol and port pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct L4Addr {
    pub proto: L4Proto,
    pub port: u16,
}

/// A service frontend address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrontendAddr {
    pub ip: IpAddr,
    pub l4: L4Addr,
}

/// A frontend address together with its allocated identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrontendAddrId {
    pub addr: FrontendAddr,
    pub id: ServiceId,
}

/// A frontend port as declared by a service, keyed by port name.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrontendPort {
    pub l4: L4Addr,
    pub id: ServiceId,
}

/// A backend address for a service frontend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub ip: IpAddr,
    pub l4: L4Addr,
}

/// Identifies a service by namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

/// The watch-derived view of a service.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    /// Absent for headless services.
    pub frontend_ip: Option<IpAddr>,
    pub headless: bool,
    pub labels: BTreeMap<String, String>,
    pub selector: BTreeMap<String, String>,
    pub ports: HashMap<String, FrontendPort>,
}

/// The watch-derived view of a service's endpoints.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EndpointsInfo {
    pub backend_ips: BTreeSet<IpAddr>,
    pub ports: HashMap<String, L4Addr>,
}

/// The service and reverse-NAT programming surface of the datapath.
///
/// Calls are idempotent: re-upserting an identical frontend/backend set is a
/// no-op for the datapath.
pub trait Datapath: Send + Sync + 'static {
    fn upsert_service(
        &self,
        frontend: FrontendAddrId,
        backends: Vec<Backend>,
        add_rev_nat: bool,
    ) -> Result<()>;

    fn delete_service(&self, frontend: &FrontendAddr) -> Result<()>;

    fn add_rev_nat(&self, id: ServiceId, frontend: &FrontendAddr) -> Result<()>;

    fn delete_rev_nat(&self, id: ServiceId) -> Result<()>;

    /// Allocates a globally unique identifier for a frontend; repeated calls
    /// for the same frontend return the same identifier.
    fn acquire_service_id(&self, frontend: &FrontendAddr) -> Result<ServiceId>;

    fn release_service_id(&self, id: ServiceId) -> Result<()>;

    fn lookup_service_id(&self, frontend: &FrontendAddr) -> Option<ServiceId>;
}

// === impl L4Proto ===

impl std::str::FromStr for L4Proto {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            other => anyhow::bail!("unsupported L4 protocol {}", other),
        }
    }
}

impl std::fmt::Display for L4Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => "TCP".fmt(f),
            Self::Udp => "UDP".fmt(f),
        }
    }
}

impl Default for L4Proto {
    fn default() -> Self {
        Self::Tcp
    }
}

// === impl FrontendAddr ===

impl FrontendAddr {
    pub fn new(ip: IpAddr, proto: L4Proto, port: u16) -> Self {
        Self {
            ip,
            l4: L4Addr { proto, port },
        }
    }
}

impl std::fmt::Display for FrontendAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.ip, self.l4.port, self.l4.proto)
    }
}

// === impl ServiceKey ===

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl ServiceInfo ===

impl ServiceInfo {
    pub fn new(
        frontend_ip: Option<IpAddr>,
        headless: bool,
        labels: BTreeMap<String, String>,
        selector: BTreeMap<String, String>,
    ) -> Self {
        Self {
            frontend_ip,
            headless,
            labels,
            selector,
            ports: HashMap::default(),
        }
    }

    /// A service without a pod selector is backed by externally managed
    /// endpoints.
    pub fn is_external(&self) -> bool {
        self.selector.is_empty()
    }

    /// Compares everything the datapath cares about, ignoring allocated
    /// frontend identifiers.
    pub fn equivalent(&self, other: &Self) -> bool {
        self.frontend_ip == other.frontend_ip
            && self.headless == other.headless
            && self.labels == other.labels
            && self.selector == other.selector
            && self.ports.len() == other.ports.len()
            && self
                .ports
                .iter()
                .all(|(name, port)| other.ports.get(name).map(|p| p.l4) == Some(port.l4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_equivalence_ignores_allocated_ids() {
        let mut a = ServiceInfo::new(
            Some("10.0.0.5".parse().unwrap()),
            false,
            BTreeMap::new(),
            BTreeMap::new(),
        );
        a.ports.insert(
            "http".to_string(),
            FrontendPort {
                l4: L4Addr {
                    proto: L4Proto::Tcp,
                    port: 80,
                },
                id: 0,
            },
        );
        let mut b = a.clone();
        b.ports.get_mut("http").unwrap().id = 7;
        assert!(a.equivalent(&b));

        b.ports.get_mut("http").unwrap().l4.port = 81;
        assert!(!a.equivalent(&b));
    }

    #[test]
    fn external_service_has_no_selector() {
        let mut svc = ServiceInfo::new(None, true, BTreeMap::new(), BTreeMap::new());
        assert!(svc.is_external());
        svc.selector.insert("app".to_string(), "web".to_string());
        assert!(!svc.is_external());
    }
}
