use anyhow::{bail, Result};
use async_trait::async_trait;
use knet_agent_core::labels::{namespace_meta_key, Map, SOURCE_K8S};
use knet_agent_core::{Label, LabelSet};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::ResourceExt;
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use tracing::warn;

use crate::Index;

/// Namespace labels join pod identities under a dedicated prefix so they
/// can never collide with the pods' own labels.
fn namespace_identity_labels(labels: &Map) -> LabelSet {
    LabelSet::new(
        labels
            .iter()
            .map(|(key, value)| Label::new(namespace_meta_key(key), value.clone(), SOURCE_K8S))
            .collect(),
    )
    .filtered()
}

// === impl Index ===

impl Index {
    pub(crate) fn update_namespace(&self, old: &k8s::Namespace, new: &k8s::Namespace) -> Result<()> {
        if old.metadata.labels == new.metadata.labels {
            return Ok(());
        }
        let name = new.name_any();

        let old_labels = namespace_identity_labels(&old.metadata.labels.clone().unwrap_or_default());
        let new_labels = namespace_identity_labels(&new.metadata.labels.clone().unwrap_or_default());

        let mut failed = false;
        for endpoint in self.endpoints.endpoints() {
            if endpoint.k8s_namespace() != name {
                continue;
            }
            if let Err(error) =
                endpoint.modify_identity_labels(new_labels.clone(), old_labels.clone())
            {
                warn!(
                    endpoint = endpoint.id(),
                    namespace = %name,
                    %error,
                    "unable to update endpoint with new namespace labels"
                );
                failed = true;
            }
        }
        if failed {
            bail!("unable to update some endpoints with new namespace labels");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<k8s::Namespace> for Index {
    /// Nothing to do: endpoints fetch namespace labels when they are
    /// created.
    async fn on_add(&self, _ns: k8s::Namespace) -> Result<()> {
        Ok(())
    }

    async fn on_update(&self, old: k8s::Namespace, new: k8s::Namespace) -> Result<()> {
        self.update_namespace(&old, &new)
    }

    /// Nothing to do: deleting a namespace deletes all of its pods, and the
    /// pod events clean up.
    async fn on_delete(&self, _ns: k8s::Namespace) -> Result<()> {
        Ok(())
    }

    fn unchanged(&self, old: &k8s::Namespace, new: &k8s::Namespace) -> bool {
        old.metadata.name == new.metadata.name && old.metadata.labels == new.metadata.labels
    }

    /// A namespace is missing when any endpoint in it lacks the synthesized
    /// namespace labels.
    fn missing(&self, snapshot: &VersionedMap<k8s::Namespace>) -> VersionedMap<k8s::Namespace> {
        let mut missing = VersionedMap::new();
        let endpoints = self.endpoints.endpoints();
        for (uid, obj) in snapshot.iter() {
            let name = obj.data.name_any();
            let labels =
                namespace_identity_labels(&obj.data.metadata.labels.clone().unwrap_or_default());
            let out_of_sync = endpoints
                .iter()
                .any(|ep| ep.k8s_namespace() == name && !ep.has_labels(&labels));
            if out_of_sync {
                missing.add(uid.clone(), obj.clone());
            }
        }
        missing
    }
}
