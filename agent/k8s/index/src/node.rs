use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use knet_agent_core::{Identity, NodeIdentity, NodeRecord, RouteTypes, Source};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::{ResourceExt, AGENT_HOST_IP_ANNOTATION};
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use std::net::IpAddr;
use tracing::{debug, warn};

use crate::Index;

fn internal_ip(node: &k8s::Node) -> Option<IpAddr> {
    node.status
        .as_ref()?
        .addresses
        .iter()
        .flatten()
        .find(|addr| addr.type_ == "InternalIP")
        .and_then(|addr| addr.address.parse().ok())
}

fn agent_ip_annotation(node: &k8s::Node) -> Option<&String> {
    node.annotations().get(AGENT_HOST_IP_ANNOTATION)
}

// === impl Index ===

impl Index {
    fn node_identity(&self, node: &k8s::Node) -> NodeIdentity {
        NodeIdentity::new(self.config.cluster_name.clone(), node.name_any())
    }

    /// The `(agent ip, host ip)` pair a node contributes to the ipcache.
    fn node_ids(&self, node: &k8s::Node) -> Result<(IpAddr, IpAddr)> {
        let name = node.name_any();
        let host_ip =
            internal_ip(node).ok_or_else(|| anyhow!("node {} has no internal IP", name))?;
        if !host_ip.is_ipv4() {
            bail!("host IP of node {} is not an IPv4 address: {}", name, host_ip);
        }
        let raw = agent_ip_annotation(node).cloned().unwrap_or_default();
        let agent_ip = raw
            .parse()
            .map_err(|_| anyhow!("no/invalid agent host IP for node {}: {:?}", name, raw))?;
        Ok((agent_ip, host_ip))
    }

    pub(crate) fn update_node_tunneling(
        &self,
        old: Option<&k8s::Node>,
        new: &k8s::Node,
    ) -> Result<()> {
        // The agent manages its own node.
        if new.name_any() == self.config.node_name {
            return Ok(());
        }
        let (agent_ip, host_ip) = self.node_ids(new)?;

        if let Some(old) = old {
            match self.node_ids(old) {
                Ok((old_agent_ip, old_host_ip)) => {
                    if old_agent_ip == agent_ip && old_host_ip == host_ip {
                        // Nothing other nodes act on has changed.
                        return Ok(());
                    }
                    // Upsert only covers same-key updates; a re-annotated
                    // node leaves its previous entry behind otherwise.
                    if old_agent_ip != agent_ip {
                        let _ = self.delete_node(old);
                    }
                }
                Err(error) => return Err(error),
            }
        }

        if !self
            .ipcache
            .upsert(agent_ip, host_ip, Identity::HOST, Source::Kubernetes)
        {
            bail!("ipcache entry for {} owned by another source", agent_ip);
        }

        let mut routes = RouteTypes::TUNNEL;
        let mut own_addr = None;
        if self.config.auto_ipv6_node_routes && self.config.device.is_some() {
            own_addr = self.config.host_ipv6.map(IpAddr::from);
            routes |= RouteTypes::DIRECT;
        }
        self.nodes.update(
            NodeRecord {
                identity: self.node_identity(new),
                host_ip,
                agent_ip,
                addresses: vec![host_ip, agent_ip],
            },
            routes,
            own_addr,
        );
        Ok(())
    }

    pub(crate) fn delete_node(&self, node: &k8s::Node) -> Result<()> {
        let name = node.name_any();
        let identity = self.node_identity(node);
        self.nodes
            .delete(&identity, RouteTypes::TUNNEL | RouteTypes::DIRECT);

        let raw = agent_ip_annotation(node).cloned().unwrap_or_default();
        let Ok(agent_ip) = raw.parse::<IpAddr>() else {
            warn!(node = %name, annotation = %raw, "unable to parse agent host IP");
            return Ok(());
        };

        match self.ipcache.lookup(&agent_ip) {
            None => {
                warn!(node = %name, ip = %agent_ip, "identity for agent host IP not found");
            }
            Some(entry) if entry.source != Source::Kubernetes => {
                // Ownership moved to the kvstore; its delete event cleans
                // up.
                debug!(node = %name, ip = %agent_ip, "ipcache entry no longer owned by the orchestrator source");
            }
            Some(_) => {
                self.ipcache.delete(&agent_ip);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<k8s::Node> for Index {
    async fn on_add(&self, node: k8s::Node) -> Result<()> {
        self.update_node_tunneling(None, &node).map_err(|error| {
            warn!(node = %node.name_any(), %error, "unable to add ipcache entry of node");
            error
        })
    }

    async fn on_update(&self, old: k8s::Node, new: k8s::Node) -> Result<()> {
        self.update_node_tunneling(Some(&old), &new).map_err(|error| {
            warn!(node = %new.name_any(), %error, "unable to update ipcache entry of node");
            error
        })
    }

    async fn on_delete(&self, node: k8s::Node) -> Result<()> {
        self.delete_node(&node)
    }

    /// Only the agent-host-ip annotation matters to peers.
    fn unchanged(&self, old: &k8s::Node, new: &k8s::Node) -> bool {
        old.metadata.name == new.metadata.name
            && agent_ip_annotation(old) == agent_ip_annotation(new)
    }

    /// A node is missing when its annotated agent IP is absent from the
    /// ipcache or not attributed to it in the node table.
    fn missing(&self, snapshot: &VersionedMap<k8s::Node>) -> VersionedMap<k8s::Node> {
        let mut missing = VersionedMap::new();
        for (uid, obj) in snapshot.iter() {
            let node = &obj.data;
            let Some(raw) = agent_ip_annotation(node) else {
                continue;
            };
            if raw.is_empty() {
                continue;
            }
            let Ok(agent_ip) = raw.parse::<IpAddr>() else {
                missing.add(uid.clone(), obj.clone());
                continue;
            };
            if self.ipcache.lookup(&agent_ip).is_none() {
                missing.add(uid.clone(), obj.clone());
                continue;
            }

            let identity = self.node_identity(node);
            let attributed = self
                .nodes
                .get(&identity)
                .map(|entry| entry.record.addresses.contains(&agent_ip))
                .unwrap_or(false);
            if !attributed {
                missing.add(uid.clone(), obj.clone());
            }
        }
        missing
    }
}
