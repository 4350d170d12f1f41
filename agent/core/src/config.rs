//! Daemon configuration consumed by the reconciliation engine.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Forms node identities together with node names.
    pub cluster_name: String,

    /// The name of the node this agent runs on; watcher events for it are
    /// ignored.
    pub node_name: String,

    /// The local host address used as the frontend of ingress services.
    pub host_ipv4: Option<Ipv4Addr>,
    pub host_ipv6: Option<Ipv6Addr>,

    /// Switches the enabled IP family to v6-only.
    pub ipv4_disabled: bool,

    /// Disables east-west service load balancing entirely.
    pub disable_service_sync: bool,

    /// Enables north-south (ingress) load balancing on this node.
    pub enable_external_lb: bool,

    /// Maintain direct IPv6 routes to peer nodes in addition to tunnel
    /// routes.
    pub auto_ipv6_node_routes: bool,

    /// The device direct routes are bound to, when configured.
    pub device: Option<String>,

    /// Interval between re-lists used to re-establish invariants.
    pub resync_period: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            node_name: String::new(),
            host_ipv4: None,
            host_ipv6: None,
            ipv4_disabled: false,
            disable_service_sync: false,
            enable_external_lb: false,
            auto_ipv6_node_routes: false,
            device: None,
            resync_period: Duration::from_secs(5 * 60),
        }
    }
}
