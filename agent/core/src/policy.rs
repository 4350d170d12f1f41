//! The policy rule model and the policy-repository interface.
//!
//! Rules are the unit of exchange with the agent's policy repository: network
//! policies parsed from the orchestrator become labeled [`Rule`]s, and the
//! repository publishes a monotonically increasing revision on every
//! mutation. Per-endpoint convergence on a revision is the signal that a
//! rule is enforced.

use crate::labels::{LabelSet, Selector};
use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single policy rule, scoped by an endpoint selector.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Selects the endpoints this rule applies to.
    pub endpoint_selector: Selector,

    /// Identifies the object this rule was derived from.
    #[serde(default, skip_serializing_if = "LabelSet::is_empty")]
    pub labels: LabelSet,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<IngressRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress: Vec<EgressRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub from_endpoints: Vec<Selector>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<PortRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_endpoints: Vec<Selector>,

    /// Services to allow; rewritten into concrete CIDR sets against the
    /// load-balancer tables before import.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_services: Vec<ServiceMatch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_cidrs: Vec<Cidr>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_ports: Vec<PortRule>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    pub port: u16,
    pub protocol: crate::lb::L4Proto,
}

/// Matches a service either by name or by a label selector, always scoped to
/// a namespace.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_service: Option<ServiceName>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_service_selector: Option<ServiceSelector>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceName {
    pub service_name: String,
    pub namespace: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSelector {
    pub selector: Selector,
    pub namespace: String,
}

/// An IP network or a bare address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum Cidr {
    Addr(std::net::IpAddr),
    Net(ipnet::IpNet),
}

/// The agent's policy repository.
///
/// Mutations return the repository revision at which the change became
/// visible. Implementations provide their own locking.
pub trait PolicyEngine: Send + Sync + 'static {
    /// Imports rules; `replace` supplants any prior rules carrying the same
    /// label set.
    fn add_rules(&self, rules: Vec<Rule>, replace: bool) -> Result<u64>;

    /// Removes all rules carrying the given labels.
    fn delete_rules(&self, labels: &LabelSet) -> Result<u64>;

    /// Indicates whether the repository holds rules for every given label
    /// set.
    fn contains_all(&self, labels: &[LabelSet]) -> bool;

    /// Applies a translator to every rule in the repository.
    fn translate_rules(&self, translator: &dyn RuleTranslator) -> Result<()>;

    /// Requests policy recomputation for all endpoints.
    fn trigger_updates(&self, reason: &str);
}

/// Rewrites rules in place, e.g. to materialize service references into
/// concrete addresses.
pub trait RuleTranslator: Send + Sync {
    fn translate(&self, rule: &mut Rule) -> Result<()>;
}

// === impl Cidr ===

impl Cidr {
    pub fn contains(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Net(this), Self::Net(other)) => this.contains(other),
            (Self::Net(this), Self::Addr(other)) => this.contains(other),
            (Self::Addr(this), Self::Net(other)) => ipnet::IpNet::from(*this).contains(other),
            (Self::Addr(this), Self::Addr(other)) => this == other,
        }
    }
}

impl From<std::net::IpAddr> for Cidr {
    fn from(addr: std::net::IpAddr) -> Self {
        Self::Addr(addr)
    }
}

impl From<ipnet::IpNet> for Cidr {
    fn from(net: ipnet::IpNet) -> Self {
        Self::Net(net)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Addr(addr) => addr.fmt(f),
            Self::Net(net) => net.fmt(f),
        }
    }
}

// === impl ServiceMatch ===

impl ServiceMatch {
    pub fn by_name(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            k8s_service: Some(ServiceName {
                service_name: name.into(),
                namespace: namespace.into(),
            }),
            k8s_service_selector: None,
        }
    }
}
