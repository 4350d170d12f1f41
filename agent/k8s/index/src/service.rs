use anyhow::Result;
use async_trait::async_trait;
use knet_agent_core::{FrontendPort, L4Addr, L4Proto, ServiceInfo, ServiceKey};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::ResourceExt;
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use tracing::{debug, info, warn};

use crate::lb::Op;
use crate::Index;

/// Maps any namespaced object onto the `(namespace, name)` key used by the
/// load-balancer join.
pub(crate) fn service_key<K: k8s::Resource>(obj: &K) -> ServiceKey {
    ServiceKey::new(obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Extracts the load-balancer view of a service, or `None` for service
/// types and states that have no datapath representation.
pub(crate) fn parse_service(svc: &k8s::Service) -> Option<ServiceInfo> {
    let namespace = svc.namespace().unwrap_or_default();
    let name = svc.name_any();
    let spec = svc.spec.as_ref()?;

    match spec.type_.as_deref().unwrap_or("ClusterIP") {
        "ClusterIP" | "NodePort" | "LoadBalancer" => {}
        // External-name services must be ignored.
        "ExternalName" => return None,
        ty => {
            warn!(%namespace, %name, r#type = ty, "ignoring service: unsupported type");
            return None;
        }
    }

    let cluster_ip = spec.cluster_ip.as_deref().unwrap_or("");
    if cluster_ip.is_empty() {
        info!(%namespace, %name, "ignoring service: empty ClusterIP");
        return None;
    }
    let headless = cluster_ip.eq_ignore_ascii_case("none");
    let frontend_ip = if headless {
        None
    } else {
        match cluster_ip.parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                warn!(%namespace, %name, %cluster_ip, "ignoring service: unparseable ClusterIP");
                return None;
            }
        }
    };

    let mut sinfo = ServiceInfo::new(
        frontend_ip,
        headless,
        svc.metadata.labels.clone().unwrap_or_default(),
        spec.selector.clone().unwrap_or_default(),
    );
    for port in spec.ports.iter().flatten() {
        let proto: L4Proto = match port.protocol.as_deref().unwrap_or("TCP").parse() {
            Ok(proto) => proto,
            Err(error) => {
                warn!(%namespace, %name, port = port.port, %error, "unable to add service port");
                continue;
            }
        };
        let Ok(port_number) = u16::try_from(port.port) else {
            warn!(%namespace, %name, port = port.port, "unable to add service port");
            continue;
        };
        sinfo
            .ports
            .entry(port.name.clone().unwrap_or_default())
            .or_insert(FrontendPort {
                l4: L4Addr {
                    proto,
                    port: port_number,
                },
                id: 0,
            });
    }
    Some(sinfo)
}

// === impl Index ===

impl Index {
    pub(crate) fn apply_service(&self, svc: &k8s::Service) -> Result<()> {
        let Some(sinfo) = parse_service(svc) else {
            return Ok(());
        };
        let key = service_key(svc);

        let mut tables = self.lb.write();
        if let Some(existing) = tables.services.get(&key) {
            if existing.equivalent(&sinfo) {
                return Ok(());
            }
        }
        tables.services.insert(key.clone(), sinfo);
        self.sync_lb(&mut tables, &key, Op::Upsert)
    }

    pub(crate) fn delete_service(&self, svc: &k8s::Service) -> Result<()> {
        let key = service_key(svc);
        debug!(service = %key, "deleting service");

        let mut tables = self.lb.write();
        self.sync_lb(&mut tables, &key, Op::Delete)
    }
}

#[async_trait]
impl EventHandler<k8s::Service> for Index {
    async fn on_add(&self, svc: k8s::Service) -> Result<()> {
        self.apply_service(&svc)
    }

    async fn on_update(&self, old: k8s::Service, new: k8s::Service) -> Result<()> {
        debug!(
            service = %service_key(&new),
            old_type = ?old.spec.as_ref().and_then(|s| s.type_.as_deref()),
            "received service update"
        );
        self.apply_service(&new)
    }

    async fn on_delete(&self, svc: k8s::Service) -> Result<()> {
        self.delete_service(&svc)
    }

    fn unchanged(&self, old: &k8s::Service, new: &k8s::Service) -> bool {
        match (parse_service(old), parse_service(new)) {
            (Some(a), Some(b)) => a.equivalent(&b),
            (None, None) => true,
            _ => false,
        }
    }

    /// A service is missing when the table has no entry for it, or the
    /// entry no longer reflects the object.
    fn missing(&self, snapshot: &VersionedMap<k8s::Service>) -> VersionedMap<k8s::Service> {
        let mut missing = VersionedMap::new();
        let tables = self.lb.read();
        for (uid, obj) in snapshot.iter() {
            let key = service_key(&obj.data);
            match tables.services.get(&key) {
                None => missing.add(uid.clone(), obj.clone()),
                Some(stored) => {
                    let matches = parse_service(&obj.data)
                        .map(|parsed| stored.equivalent(&parsed))
                        .unwrap_or(false);
                    if !matches {
                        missing.add(uid.clone(), obj.clone());
                    }
                }
            }
        }
        missing
    }
}
