use anyhow::Result;
use async_trait::async_trait;
use knet_agent_core::{EndpointsInfo, L4Addr, L4Proto};
use knet_agent_k8s_api as k8s;
use knet_agent_k8s_api::ResourceExt;
use knet_agent_k8s_watch::{EventHandler, VersionedMap};
use tracing::{debug, error, info, warn};

use crate::lb::Op;
use crate::service::service_key;
use crate::translate::ServiceTranslator;
use crate::Index;

/// Flattens endpoint subsets into the set of backend addresses and the
/// named backend ports.
pub(crate) fn parse_endpoints(ep: &k8s::Endpoints) -> EndpointsInfo {
    let namespace = ep.namespace().unwrap_or_default();
    let name = ep.name_any();

    let mut info = EndpointsInfo::default();
    for subset in ep.subsets.iter().flatten() {
        for addr in subset.addresses.iter().flatten() {
            match addr.ip.parse() {
                Ok(ip) => {
                    info.backend_ips.insert(ip);
                }
                Err(_) => warn!(%namespace, %name, ip = %addr.ip, "skipping unparseable backend address"),
            }
        }
        for port in subset.ports.iter().flatten() {
            let proto: L4Proto = match port.protocol.as_deref().unwrap_or("TCP").parse() {
                Ok(proto) => proto,
                Err(error) => {
                    warn!(%namespace, %name, %error, "error while creating a backend port");
                    continue;
                }
            };
            let Ok(port_number) = u16::try_from(port.port) else {
                warn!(%namespace, %name, port = port.port, "error while creating a backend port");
                continue;
            };
            info.ports.insert(
                port.name.clone().unwrap_or_default(),
                L4Addr {
                    proto,
                    port: port_number,
                },
            );
        }
    }
    info
}

// === impl Index ===

impl Index {
    pub(crate) fn apply_endpoints(&self, ep: &k8s::Endpoints) -> Result<()> {
        let key = service_key(ep);
        let new_eps = parse_endpoints(ep);

        let mut tables = self.lb.write();

        // Whether the content changed decides below if a policy update
        // trigger is needed; the join is re-synced either way.
        let endpoints_equal = tables
            .endpoints
            .get(&key)
            .map(|stored| *stored == new_eps)
            .unwrap_or(false);
        tables.endpoints.insert(key.clone(), new_eps.clone());

        // A failed install is retried by resync; the translation below must
        // still run.
        let _ = self.sync_lb(&mut tables, &key, Op::Upsert);

        if self.config.enable_external_lb {
            if let Err(error) = self.sync_external_lb(&mut tables, &key, Op::Upsert) {
                error!(service = %key, %error, "unable to add endpoints on ingress service");
                return Err(error);
            }
        }

        let Some(svc) = tables.services.get(&key).cloned() else {
            return Ok(());
        };
        if !svc.is_external() {
            return Ok(());
        }

        // Rules referencing this external service materialize its backends;
        // retry whenever the previous translation failed.
        let cached = self.endpoint_imports.get(&key);
        let succeeded_before = matches!(
            &cached,
            Some(meta) if meta.translation_error.is_none()
        );
        if !succeeded_before {
            let translator =
                ServiceTranslator::new(key.clone(), new_eps.clone(), false, svc.labels.clone());
            let result = self.policy.translate_rules(&translator);
            self.endpoint_imports
                .upsert(&key, result.as_ref().err().map(|e| e.to_string()));
            return match result {
                Ok(()) => {
                    info!(service = %key, "service endpoints imported into policy rules");
                    self.policy.trigger_updates("service endpoints added");
                    Ok(())
                }
                Err(error) => {
                    error!(service = %key, %error, "unable to repopulate egress policies from toServices rules");
                    Err(error)
                }
            };
        }

        if endpoints_equal {
            debug!(service = %key, "no changes to service endpoints; not triggering policy updates");
            return Ok(());
        }
        info!(service = %key, "service endpoints updated");
        self.policy.trigger_updates("service endpoints updated");
        Ok(())
    }

    pub(crate) fn delete_endpoints(&self, ep: &k8s::Endpoints) -> Result<()> {
        let key = service_key(ep);

        let mut tables = self.lb.write();

        if let Some(eps) = tables.endpoints.get(&key).cloned() {
            if let Some(svc) = tables.services.get(&key) {
                if svc.is_external() {
                    let translator =
                        ServiceTranslator::new(key.clone(), eps, true, svc.labels.clone());
                    match self.policy.translate_rules(&translator) {
                        Ok(()) => self.policy.trigger_updates("service endpoints deleted"),
                        Err(error) => {
                            error!(service = %key, %error, "unable to depopulate egress policies from toServices rules")
                        }
                    }
                }
            }
        }

        let sync_result = self.sync_lb(&mut tables, &key, Op::DeleteBackends);
        if self.config.enable_external_lb {
            if let Err(error) = self.sync_external_lb(&mut tables, &key, Op::Delete) {
                error!(service = %key, %error, "unable to remove endpoints on ingress service");
                return Err(error);
            }
        }
        self.endpoint_imports.delete(&key);
        sync_result
    }
}

#[async_trait]
impl EventHandler<k8s::Endpoints> for Index {
    async fn on_add(&self, ep: k8s::Endpoints) -> Result<()> {
        self.apply_endpoints(&ep)
    }

    async fn on_update(&self, _old: k8s::Endpoints, new: k8s::Endpoints) -> Result<()> {
        self.apply_endpoints(&new)
    }

    async fn on_delete(&self, ep: k8s::Endpoints) -> Result<()> {
        self.delete_endpoints(&ep)
    }

    fn unchanged(&self, old: &k8s::Endpoints, new: &k8s::Endpoints) -> bool {
        parse_endpoints(old) == parse_endpoints(new)
    }

    fn missing(&self, snapshot: &VersionedMap<k8s::Endpoints>) -> VersionedMap<k8s::Endpoints> {
        // Parse outside the table lock.
        let parsed: Vec<_> = snapshot
            .iter()
            .map(|(uid, obj)| (uid, obj, service_key(&obj.data), parse_endpoints(&obj.data)))
            .collect();

        let mut missing = VersionedMap::new();
        let tables = self.lb.read();
        for (uid, obj, key, eps) in parsed {
            match tables.endpoints.get(&key) {
                Some(stored) if *stored == eps => {}
                _ => missing.add(uid.clone(), obj.clone()),
            }
        }
        missing
    }
}

/// Field selector excluding the control-plane leader-election endpoints,
/// which update continuously and never carry backends we care about.
pub fn endpoints_field_selector() -> String {
    "metadata.name!=kube-scheduler,metadata.name!=kube-controller-manager".to_string()
}
