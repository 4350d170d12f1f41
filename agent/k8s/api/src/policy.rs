//! The `KnetNetworkPolicy` custom resource.
//!
//! A cluster-scoped policy format richer than the builtin NetworkPolicy: its
//! rules may reference services (`toServices`) and CIDRs, and every agent
//! reports enforcement back through a per-node status map.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use knet_agent_core::labels::{Label, LabelSet, NAMESPACE_LABEL, SOURCE_K8S};
use knet_agent_core::Rule;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const POLICY_NAME_LABEL: &str = "io.knet.k8s.policy.name";
pub const POLICY_NAMESPACE_LABEL: &str = "io.knet.k8s.policy.namespace";
pub const POLICY_UID_LABEL: &str = "io.knet.k8s.policy.uid";
pub const POLICY_DERIVED_FROM_LABEL: &str = "io.knet.k8s.policy.derived-from";

/// `derivedFrom` value for rules imported from `KnetNetworkPolicy` objects.
pub const RESOURCE_TYPE_KNET_NETWORK_POLICY: &str = "KnetNetworkPolicy";

/// `derivedFrom` value for rules imported from builtin NetworkPolicy
/// objects.
pub const RESOURCE_TYPE_NETWORK_POLICY: &str = "NetworkPolicy";

#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "knet.io",
    version = "v2",
    kind = "KnetNetworkPolicy",
    plural = "knetnetworkpolicies",
    shortname = "knp",
    status = "KnetNetworkPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KnetNetworkPolicySpec {
    /// A single rule; mutually composable with `rules`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<Rule>>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KnetNetworkPolicyStatus {
    /// Enforcement state per node, keyed by node name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, PolicyNodeStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyNodeStatus {
    pub enforcing: bool,
    pub ok: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The policy-repository revision the rules were imported at; absent
    /// when the import failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,

    pub last_updated: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Derives the rule labels identifying a policy object.
pub fn policy_labels(namespace: &str, name: &str, uid: &str, derived_from: &str) -> LabelSet {
    LabelSet::new(vec![
        Label::new(POLICY_NAME_LABEL, name, SOURCE_K8S),
        Label::new(POLICY_NAMESPACE_LABEL, namespace, SOURCE_K8S),
        Label::new(POLICY_UID_LABEL, uid, SOURCE_K8S),
        Label::new(POLICY_DERIVED_FROM_LABEL, derived_from, SOURCE_K8S),
    ])
}

// === impl KnetNetworkPolicy ===

impl KnetNetworkPolicy {
    /// Flattens `spec.rule` and `spec.rules` into labeled rules scoped to
    /// the policy's namespace.
    pub fn parse_rules(&self) -> Result<Vec<Rule>> {
        let namespace = self
            .namespace()
            .ok_or_else(|| anyhow!("policy is missing a namespace"))?;
        let labels = self.rule_labels()?;

        let mut rules = Vec::new();
        if let Some(rule) = &self.spec.rule {
            rules.push(rule.clone());
        }
        if let Some(more) = &self.spec.rules {
            rules.extend(more.iter().cloned());
        }
        if rules.is_empty() {
            bail!("policy {}/{} contains no rules", namespace, self.name_unchecked());
        }

        for rule in &mut rules {
            rule.labels = labels.clone();
            rule.endpoint_selector = rule
                .endpoint_selector
                .clone()
                .with_match_label(NAMESPACE_LABEL, namespace.clone());
        }
        Ok(rules)
    }

    /// The labels attached to every rule imported from this policy.
    pub fn rule_labels(&self) -> Result<LabelSet> {
        let namespace = self
            .namespace()
            .ok_or_else(|| anyhow!("policy is missing a namespace"))?;
        let uid = self
            .uid()
            .ok_or_else(|| anyhow!("policy is missing a uid"))?;
        Ok(policy_labels(
            &namespace,
            &self.name_unchecked(),
            &uid,
            RESOURCE_TYPE_KNET_NETWORK_POLICY,
        ))
    }

    /// Names the long-lived status write-back task for this policy. The
    /// name is derived from the object's uid so it survives spec updates
    /// but not a delete/re-create.
    pub fn status_task_name(&self) -> String {
        format!(
            "policy-node-status ({})",
            self.uid().unwrap_or_else(|| self.name_unchecked())
        )
    }

    pub fn spec_equals(&self, other: &Self) -> bool {
        self.spec == other.spec
    }

    pub fn annotations_equals(&self, other: &Self) -> bool {
        self.metadata.annotations == other.metadata.annotations
    }

    pub fn set_node_status(&mut self, node: &str, status: PolicyNodeStatus) {
        self.status
            .get_or_insert_with(Default::default)
            .nodes
            .insert(node.to_string(), status);
    }
}
