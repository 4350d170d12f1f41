use anyhow::{anyhow, Result};
use async_trait::async_trait;
use knet_agent_core::{FrontendAddr, FrontendPort, L4Addr, L4Proto, ServiceInfo, ServiceKey};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::api::networking::v1::{
    IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
};
use knet_agent_k8s_api::{Api, Client, PostParams, ResourceExt};
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use std::net::IpAddr;
use tracing::{debug, error, warn};

use crate::lb::Op;
use crate::Index;

/// Writes an ingress object's status back to the API server.
#[async_trait]
pub trait IngressStatusClient: Send + Sync + 'static {
    async fn update_status(&self, ingress: &k8s::Ingress) -> Result<()>;
}

/// [`IngressStatusClient`] backed by the cluster API.
pub struct ApiIngressStatusClient {
    client: Client,
}

// === impl ApiIngressStatusClient ===

impl ApiIngressStatusClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngressStatusClient for ApiIngressStatusClient {
    async fn update_status(&self, ingress: &k8s::Ingress) -> Result<()> {
        let namespace = ingress
            .namespace()
            .ok_or_else(|| anyhow!("ingress is missing a namespace"))?;
        let api: Api<k8s::Ingress> = Api::namespaced(self.client.clone(), &namespace);
        api.replace_status(
            &ingress.name_any(),
            &PostParams::default(),
            serde_json::to_vec(ingress)?,
        )
        .await?;
        Ok(())
    }
}

/// The backing service reference of a single-service ingress: `(service
/// name, port name, port number)`.
fn ingress_backend(ingress: &k8s::Ingress) -> Option<(String, String, u16)> {
    let service = ingress.spec.as_ref()?.default_backend.as_ref()?.service.as_ref()?;
    let port = service.port.as_ref()?;
    let number = u16::try_from(port.number?).ok()?;
    Some((
        service.name.clone(),
        port.name.clone().unwrap_or_default(),
        number,
    ))
}

fn status_addresses(ingress: &k8s::Ingress) -> Vec<IpAddr> {
    ingress
        .status
        .iter()
        .filter_map(|status| status.load_balancer.as_ref())
        .flat_map(|lb| lb.ingress.iter().flatten())
        .filter_map(|entry| entry.ip.as_deref())
        .filter_map(|ip| ip.parse().ok())
        .collect()
}

// === impl Index ===

impl Index {
    /// The local address ingress frontends bind, in the enabled family.
    fn ingress_frontend_ip(&self) -> Result<IpAddr> {
        let host = if self.config.ipv4_disabled {
            self.config.host_ipv6.map(IpAddr::from)
        } else {
            self.config.host_ipv4.map(IpAddr::from)
        };
        host.ok_or_else(|| anyhow!("no local host address configured for ingress frontends"))
    }

    pub(crate) async fn apply_ingress(&self, ingress: &k8s::Ingress) -> Result<()> {
        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        let Some((service_name, port_name, port)) = ingress_backend(ingress) else {
            // Only single-service ingresses are supported.
            warn!(%namespace, %name, "unsupported ingress without a single backing service; ignoring");
            return Ok(());
        };
        if !self.config.enable_external_lb {
            return Ok(());
        }

        let key = ServiceKey::new(namespace, service_name);
        let host = self.ingress_frontend_ip()?;
        let mut info = ServiceInfo::new(Some(host), false, Default::default(), Default::default());
        info.ports.insert(
            port_name,
            FrontendPort {
                l4: L4Addr {
                    proto: L4Proto::Tcp,
                    port,
                },
                id: 0,
            },
        );

        {
            let mut tables = self.lb.write();
            tables.ingress.insert(key.clone(), info);
            self.sync_external_lb(&mut tables, &key, Op::Upsert)
                .map_err(|error| {
                    error!(ingress = %name, service = %key, %error, "unable to add ingress service");
                    error
                })?;
        }

        // Publish the frontend so peers and non-LB nodes learn it.
        let mut updated = ingress.clone();
        updated.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    ip: Some(host.to_string()),
                    hostname: Some(self.config.node_name.clone()),
                    ports: None,
                }]),
            }),
        });
        self.ingress_status
            .update_status(&updated)
            .await
            .map_err(|error| {
                error!(ingress = %name, %error, "unable to update ingress status");
                error
            })
    }

    pub(crate) async fn update_ingress(
        &self,
        old: &k8s::Ingress,
        new: &k8s::Ingress,
    ) -> Result<()> {
        let (Some(old_backend), Some(new_backend)) = (ingress_backend(old), ingress_backend(new))
        else {
            warn!(
                ingress = %new.name_any(),
                "unsupported ingress without a single backing service; ignoring"
            );
            return Ok(());
        };

        if !self.config.enable_external_lb {
            // A load-balancing node published its address; register the
            // reverse-NAT mapping for it.
            for ip in status_addresses(new) {
                let frontend = FrontendAddr::new(ip, L4Proto::Tcp, new_backend.2);
                match self.datapath.acquire_service_id(&frontend) {
                    Ok(id) => {
                        if let Err(error) = self.datapath.add_rev_nat(id, &frontend) {
                            error!(%frontend, id, %error, "unable to add reverse NAT for ingress");
                        }
                    }
                    Err(error) => {
                        error!(%frontend, %error, "unable to allocate a frontend id for ingress");
                    }
                }
            }
            return Ok(());
        }

        if old_backend == new_backend {
            return Ok(());
        }
        self.apply_ingress(new).await
    }

    pub(crate) async fn delete_ingress(&self, ingress: &k8s::Ingress) -> Result<()> {
        let namespace = ingress.namespace().unwrap_or_default();
        let name = ingress.name_any();
        let Some((service_name, _, port)) = ingress_backend(ingress) else {
            warn!(%namespace, %name, "unsupported ingress without a single backing service; ignoring");
            return Ok(());
        };

        if !self.config.enable_external_lb {
            for ip in status_addresses(ingress) {
                let frontend = FrontendAddr::new(ip, L4Proto::Tcp, port);
                // The allocator is the only way to recover the id without
                // consulting external state.
                if let Some(id) = self.datapath.lookup_service_id(&frontend) {
                    if let Err(error) = self.datapath.delete_rev_nat(id) {
                        error!(%frontend, id, %error, "error while removing reverse NAT for ingress");
                    }
                }
            }
            return Ok(());
        }

        let key = ServiceKey::new(namespace, service_name);
        let mut tables = self.lb.write();
        let Some(info) = tables.ingress.get(&key) else {
            return Ok(());
        };
        let Some(endpoints) = tables.endpoints.get(&key) else {
            return Ok(());
        };
        self.uninstall_service(&key, info, endpoints)
            .map_err(|error| {
                error!(ingress = %name, service = %key, %error, "unable to delete ingress service");
                error
            })?;
        tables.ingress.remove(&key);
        debug!(ingress = %name, service = %key, "removed ingress service");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<k8s::Ingress> for Index {
    async fn on_add(&self, ingress: k8s::Ingress) -> Result<()> {
        self.apply_ingress(&ingress).await
    }

    async fn on_update(&self, old: k8s::Ingress, new: k8s::Ingress) -> Result<()> {
        self.update_ingress(&old, &new).await
    }

    async fn on_delete(&self, ingress: k8s::Ingress) -> Result<()> {
        self.delete_ingress(&ingress).await
    }

    fn unchanged(&self, old: &k8s::Ingress, new: &k8s::Ingress) -> bool {
        ingress_backend(old) == ingress_backend(new)
            && status_addresses(old) == status_addresses(new)
    }

    /// An ingress is missing when the ingress table has no entry matching
    /// its synthesized service.
    fn missing(&self, snapshot: &VersionedMap<k8s::Ingress>) -> VersionedMap<k8s::Ingress> {
        let mut missing = VersionedMap::new();
        let Ok(host) = self.ingress_frontend_ip() else {
            return missing;
        };
        let tables = self.lb.read();
        for (uid, obj) in snapshot.iter() {
            let Some((service_name, port_name, port)) = ingress_backend(&obj.data) else {
                continue;
            };
            let key = ServiceKey::new(obj.data.namespace().unwrap_or_default(), service_name);
            let mut expected =
                ServiceInfo::new(Some(host), false, Default::default(), Default::default());
            expected.ports.insert(
                port_name,
                FrontendPort {
                    l4: L4Addr {
                        proto: L4Proto::Tcp,
                        port,
                    },
                    id: 0,
                },
            );
            let in_sync = tables
                .ingress
                .get(&key)
                .map(|stored| stored.equivalent(&expected))
                .unwrap_or(false);
            if !in_sync {
                missing.add(uid.clone(), obj.clone());
            }
        }
        missing
    }
}
