use anyhow::{anyhow, Result};
use async_trait::async_trait;
use knet_agent_core::labels::SOURCE_K8S;
use knet_agent_core::{Identity, LabelSet, Source};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::ResourceExt;
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use std::net::IpAddr;
use tracing::debug;

use crate::Index;

/// The pod and host addresses relevant to the ipcache, or the reason the
/// pod has none.
fn pod_addresses(pod: &k8s::Pod) -> Result<(IpAddr, IpAddr)> {
    if pod
        .spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
    {
        return Err(anyhow!("pod is using host networking"));
    }
    let status = pod
        .status
        .as_ref()
        .ok_or_else(|| anyhow!("pod has no status"))?;
    let host_ip = status
        .host_ip
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(|_| anyhow!("no/invalid host IP: {:?}", status.host_ip))?;
    let pod_ip = status
        .pod_ip
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(|_| anyhow!("no/invalid pod IP: {:?}", status.pod_ip))?;
    Ok((pod_ip, host_ip))
}

fn identity_labels(pod: &k8s::Pod) -> LabelSet {
    LabelSet::from_map(&pod.metadata.labels.clone().unwrap_or_default(), SOURCE_K8S).filtered()
}

// === impl Index ===

impl Index {
    pub(crate) fn apply_pod(&self, pod: &k8s::Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        match pod_addresses(pod) {
            Err(reason) => {
                debug!(%namespace, %name, %reason, "skipped ipcache update on pod event");
            }
            Ok((pod_ip, host_ip)) => {
                if self
                    .ipcache
                    .upsert(pod_ip, host_ip, Identity::CLUSTER, Source::Kubernetes)
                {
                    debug!(%namespace, %name, %pod_ip, "updated ipcache entry on pod event");
                } else {
                    debug!(%namespace, %name, %pod_ip, "ipcache entry owned by another source");
                }
            }
        }
        Ok(())
    }

    pub(crate) fn update_pod(&self, old: &k8s::Pod, new: &k8s::Pod) -> Result<()> {
        // The pod IP can only move from unassigned to assigned, so the add
        // path covers address changes.
        let _ = self.apply_pod(new);

        if old.metadata.labels == new.metadata.labels {
            return Ok(());
        }

        let namespace = new.namespace().unwrap_or_default();
        let name = new.name_any();
        let Some(endpoint) = self.endpoints.lookup_pod(&namespace, &name) else {
            debug!(%namespace, %name, "no local endpoint for labeled pod");
            return Ok(());
        };

        let new_labels = identity_labels(new);
        let old_labels = identity_labels(old);
        endpoint
            .modify_identity_labels(new_labels.clone(), old_labels)
            .map_err(|error| {
                debug!(%namespace, %name, %error, "error while updating endpoint with new labels");
                error
            })?;
        debug!(
            endpoint = endpoint.id(),
            labels = %new_labels,
            "updated endpoint with new pod labels"
        );
        Ok(())
    }

    pub(crate) fn delete_pod(&self, pod: &k8s::Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        match pod_addresses(pod) {
            Err(reason) => {
                debug!(%namespace, %name, %reason, "skipped ipcache delete on pod delete");
            }
            Ok((pod_ip, _)) => match self.ipcache.lookup(&pod_ip) {
                None => debug!(%namespace, %name, %pod_ip, "no ipcache entry for deleted pod"),
                Some(entry) if entry.source != Source::Kubernetes => {
                    debug!(%namespace, %name, %pod_ip, "ipcache entry not owned by the orchestrator source");
                }
                Some(_) => {
                    self.ipcache.delete(&pod_ip);
                    debug!(%namespace, %name, %pod_ip, "deleted ipcache entry on pod delete");
                }
            },
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler<k8s::Pod> for Index {
    async fn on_add(&self, pod: k8s::Pod) -> Result<()> {
        self.apply_pod(&pod)
    }

    async fn on_update(&self, old: k8s::Pod, new: k8s::Pod) -> Result<()> {
        self.update_pod(&old, &new)
    }

    async fn on_delete(&self, pod: k8s::Pod) -> Result<()> {
        self.delete_pod(&pod)
    }

    fn unchanged(&self, old: &k8s::Pod, new: &k8s::Pod) -> bool {
        let addresses = |pod: &k8s::Pod| {
            pod.status
                .as_ref()
                .map(|status| (status.pod_ip.clone(), status.host_ip.clone()))
        };
        addresses(old) == addresses(new) && old.metadata.labels == new.metadata.labels
    }

    /// A pod is missing when its IP is absent from the ipcache, or a local
    /// endpoint exists whose labels diverge from the pod's.
    fn missing(&self, snapshot: &VersionedMap<k8s::Pod>) -> VersionedMap<k8s::Pod> {
        let mut missing = VersionedMap::new();
        for (uid, obj) in snapshot.iter() {
            let pod = &obj.data;
            let pod_ip: Option<IpAddr> = pod
                .status
                .as_ref()
                .and_then(|status| status.pod_ip.as_deref())
                .and_then(|ip| ip.parse().ok());
            match pod_ip {
                None => {
                    missing.add(uid.clone(), obj.clone());
                    continue;
                }
                Some(ip) => {
                    if self.ipcache.lookup(&ip).is_none() {
                        missing.add(uid.clone(), obj.clone());
                        continue;
                    }
                }
            }

            // Only one endpoint in the cluster manages the pod; when it is
            // not local there is nothing further to reconcile.
            let namespace = pod.namespace().unwrap_or_default();
            let Some(endpoint) = self.endpoints.lookup_pod(&namespace, &pod.name_any()) else {
                continue;
            };
            if endpoint.pod_labels() != identity_labels(pod) {
                missing.add(uid.clone(), obj.clone());
            }
        }
        missing
    }
}
