//! The node/tunneling table.
//!
//! Tracks every peer node's addressing so the datapath can maintain tunnel
//! and, when configured, direct routes toward it.

use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use std::net::IpAddr;

/// Identifies a node within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeIdentity {
    pub cluster: String,
    pub name: String,
}

/// Publicly visible addressing for a peer node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRecord {
    pub identity: NodeIdentity,

    /// The node's primary (IPv4) address.
    pub host_ip: IpAddr,

    /// The address of the agent's own interface on the node.
    pub agent_ip: IpAddr,

    /// All addresses attributed to the node, including `agent_ip`.
    pub addresses: Vec<IpAddr>,
}

/// Which route kinds are maintained toward a node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteTypes(u8);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    pub record: NodeRecord,
    pub routes: RouteTypes,

    /// Local address used as the source of direct routes.
    pub own_addr: Option<IpAddr>,
}

#[derive(Default)]
pub struct NodeTable {
    nodes: RwLock<HashMap<NodeIdentity, NodeEntry>>,
}

// === impl NodeIdentity ===

impl NodeIdentity {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.cluster, self.name)
    }
}

// === impl NodeRecord ===

impl NodeRecord {
    /// Compares the attributes other nodes act on.
    pub fn public_attrs_equal(&self, other: &Self) -> bool {
        self.identity == other.identity
            && self.host_ip == other.host_ip
            && self.agent_ip == other.agent_ip
    }
}

// === impl RouteTypes ===

impl RouteTypes {
    pub const TUNNEL: RouteTypes = RouteTypes(1);
    pub const DIRECT: RouteTypes = RouteTypes(2);

    pub fn contains(self, other: RouteTypes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn without(self, other: RouteTypes) -> RouteTypes {
        RouteTypes(self.0 & !other.0)
    }
}

impl std::ops::BitOr for RouteTypes {
    type Output = RouteTypes;

    fn bitor(self, rhs: RouteTypes) -> RouteTypes {
        RouteTypes(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for RouteTypes {
    fn bitor_assign(&mut self, rhs: RouteTypes) {
        self.0 |= rhs.0;
    }
}

// === impl NodeTable ===

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node, recording which route kinds are
    /// maintained toward it.
    pub fn update(&self, record: NodeRecord, routes: RouteTypes, own_addr: Option<IpAddr>) {
        let mut nodes = self.nodes.write();
        nodes.insert(
            record.identity.clone(),
            NodeEntry {
                record,
                routes,
                own_addr,
            },
        );
    }

    /// Withdraws the given route kinds; the node is dropped once no route
    /// kind remains.
    pub fn delete(&self, identity: &NodeIdentity, routes: RouteTypes) {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.get_mut(identity) {
            entry.routes = entry.routes.without(routes);
            if entry.routes.is_empty() {
                nodes.remove(identity);
            }
        }
    }

    pub fn get(&self, identity: &NodeIdentity) -> Option<NodeEntry> {
        self.nodes.read().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
