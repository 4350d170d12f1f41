//! Interfaces to the agent's local workload endpoints.

use crate::labels::LabelSet;
use anyhow::Result;
use std::sync::Arc;

/// A workload endpoint managed by this node's agent.
pub trait Endpoint: Send + Sync {
    fn id(&self) -> u64;

    /// The namespace of the pod this endpoint backs.
    fn k8s_namespace(&self) -> String;

    /// The filtered pod labels currently attributed to the endpoint.
    fn pod_labels(&self) -> LabelSet;

    /// Indicates whether all of the given labels are attributed to the
    /// endpoint.
    fn has_labels(&self, labels: &LabelSet) -> bool;

    /// Replaces `remove` with `add` in the endpoint's identity labels,
    /// triggering identity recomputation.
    fn modify_identity_labels(&self, add: LabelSet, remove: LabelSet) -> Result<()>;
}

/// The agent's endpoint registry.
#[async_trait::async_trait]
pub trait EndpointManager: Send + Sync + 'static {
    /// Looks up the endpoint backing the named pod, if this node manages it.
    fn lookup_pod(&self, namespace: &str, name: &str) -> Option<Arc<dyn Endpoint>>;

    fn endpoints(&self) -> Vec<Arc<dyn Endpoint>>;

    /// Resolves once every local endpoint has regenerated at or past the
    /// given policy revision. Callers bound the wait with a timeout.
    async fn wait_for_policy_revision(&self, revision: u64) -> Result<()>;
}
