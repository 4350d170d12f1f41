use anyhow::{anyhow, Result};
use async_trait::async_trait;
use knet_agent_core::labels::{namespace_meta_key, Expression, Operator, NAMESPACE_LABEL};
use knet_agent_core::policy::{EgressRule, IngressRule, PortRule};
use knet_agent_core::{L4Proto, LabelSet, Rule, Selector};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::policy::{policy_labels, RESOURCE_TYPE_NETWORK_POLICY};
use knet_agent_k8s_api::{IntOrString, ResourceExt};
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use tracing::{debug, info, warn};

use crate::Index;

use knet_agent_k8s_api::api::networking::v1 as networking;

fn convert_selector(selector: &k8s::LabelSelector) -> Selector {
    let mut converted = Selector::default();
    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            converted = converted.with_match_label(key.clone(), value.clone());
        }
    }
    for requirement in selector.match_expressions.iter().flatten() {
        let operator = match requirement.operator.as_str() {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            other => {
                warn!(operator = other, "skipping unknown selector operator");
                continue;
            }
        };
        let values = requirement
            .values
            .as_ref()
            .map(|vs| vs.iter().cloned().collect());
        converted = converted.and(Selector::from_expressions(vec![Expression::new(
            requirement.key.clone(),
            operator,
            values,
        )]));
    }
    converted
}

/// A policy peer selects pods in the policy's own namespace unless a
/// namespace selector widens it; namespace selectors are expressed against
/// the namespace-meta labels attributed to every endpoint.
fn convert_peer(peer: &networking::NetworkPolicyPeer, namespace: &str) -> Selector {
    let pods = peer
        .pod_selector
        .as_ref()
        .map(convert_selector)
        .unwrap_or_default();
    match &peer.namespace_selector {
        Some(namespaces) => {
            pods.and(convert_selector(namespaces).map_keys(|key| namespace_meta_key(key)))
        }
        None => pods.with_match_label(NAMESPACE_LABEL, namespace),
    }
}

fn convert_port(port: &networking::NetworkPolicyPort) -> Option<PortRule> {
    let proto: L4Proto = match port.protocol.as_deref().unwrap_or("TCP").parse() {
        Ok(proto) => proto,
        Err(error) => {
            warn!(%error, "skipping policy port");
            return None;
        }
    };
    match &port.port {
        Some(IntOrString::Int(number)) => u16::try_from(*number)
            .ok()
            .map(|port| PortRule { port, protocol: proto }),
        Some(IntOrString::String(name)) => {
            // Named ports resolve per pod; the policy repository only takes
            // numeric ports.
            warn!(port = %name, "skipping named policy port");
            None
        }
        None => None,
    }
}

/// Converts a builtin NetworkPolicy into one labeled rule.
pub(crate) fn parse_network_policy(np: &k8s::NetworkPolicy) -> Result<Vec<Rule>> {
    let namespace = np
        .namespace()
        .ok_or_else(|| anyhow!("network policy is missing a namespace"))?;
    let labels = network_policy_labels(np)?;
    let spec = np.spec.clone().unwrap_or_default();

    let ingress = spec
        .ingress
        .iter()
        .flatten()
        .map(|rule| IngressRule {
            from_endpoints: rule
                .from
                .iter()
                .flatten()
                .map(|peer| convert_peer(peer, &namespace))
                .collect(),
            to_ports: rule.ports.iter().flatten().filter_map(convert_port).collect(),
        })
        .collect();

    let egress = spec
        .egress
        .iter()
        .flatten()
        .map(|rule| EgressRule {
            to_endpoints: rule
                .to
                .iter()
                .flatten()
                .map(|peer| convert_peer(peer, &namespace))
                .collect(),
            to_ports: rule.ports.iter().flatten().filter_map(convert_port).collect(),
            ..Default::default()
        })
        .collect();

    Ok(vec![Rule {
        endpoint_selector: convert_selector(&spec.pod_selector)
            .with_match_label(NAMESPACE_LABEL, namespace),
        labels,
        ingress,
        egress,
    }])
}

pub(crate) fn network_policy_labels(np: &k8s::NetworkPolicy) -> Result<LabelSet> {
    let namespace = np
        .namespace()
        .ok_or_else(|| anyhow!("network policy is missing a namespace"))?;
    let uid = np
        .uid()
        .ok_or_else(|| anyhow!("network policy is missing a uid"))?;
    Ok(policy_labels(
        &namespace,
        &np.name_any(),
        &uid,
        RESOURCE_TYPE_NETWORK_POLICY,
    ))
}

// === impl Index ===

impl Index {
    pub(crate) fn apply_network_policy(&self, np: &k8s::NetworkPolicy) -> Result<()> {
        let rules = parse_network_policy(np).map_err(|error| {
            warn!(%error, "error while parsing network policy");
            error
        })?;

        // Rules carry this policy's labels, so replacement supplants any
        // prior revision of the same object.
        self.policy.add_rules(rules, true).map_err(|error| {
            warn!(%error, "unable to add network policy rules to the policy repository");
            error
        })?;

        info!(
            namespace = %np.namespace().unwrap_or_default(),
            name = %np.name_any(),
            "network policy imported"
        );
        Ok(())
    }

    pub(crate) fn delete_network_policy(&self, np: &k8s::NetworkPolicy) -> Result<()> {
        let labels = network_policy_labels(np)?;
        self.policy.delete_rules(&labels).map_err(|error| {
            warn!(%error, "error while deleting network policy");
            error
        })?;
        info!(
            namespace = %np.namespace().unwrap_or_default(),
            name = %np.name_any(),
            "network policy removed"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler<k8s::NetworkPolicy> for Index {
    async fn on_add(&self, np: k8s::NetworkPolicy) -> Result<()> {
        self.apply_network_policy(&np)
    }

    async fn on_update(&self, old: k8s::NetworkPolicy, new: k8s::NetworkPolicy) -> Result<()> {
        debug!(
            namespace = %new.namespace().unwrap_or_default(),
            name = %new.name_any(),
            old_name = %old.name_any(),
            "received network policy update"
        );
        self.apply_network_policy(&new)
    }

    async fn on_delete(&self, np: k8s::NetworkPolicy) -> Result<()> {
        self.delete_network_policy(&np)
    }

    fn unchanged(&self, old: &k8s::NetworkPolicy, new: &k8s::NetworkPolicy) -> bool {
        old.metadata.name == new.metadata.name
            && old.metadata.namespace == new.metadata.namespace
            && old.spec == new.spec
    }

    fn missing(
        &self,
        snapshot: &VersionedMap<k8s::NetworkPolicy>,
    ) -> VersionedMap<k8s::NetworkPolicy> {
        let mut missing = VersionedMap::new();
        for (uid, obj) in snapshot.iter() {
            let Ok(labels) = network_policy_labels(&obj.data) else {
                continue;
            };
            if !self.policy.contains_all(&[labels]) {
                missing.add(uid.clone(), obj.clone());
            }
        }
        missing
    }
}
