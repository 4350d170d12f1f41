//! The load-balancer service table and datapath install/uninstall.
//!
//! Services, Endpoints and Ingresses are joined by `(namespace, name)`
//! under one coarse lock. An entry reaches the datapath only once both
//! sides of its join are present; partial joins wait for the other side's
//! next event (or for resync).

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{bail, Result};
use knet_agent_core::{
    Backend, Config, EndpointsInfo, FrontendAddr, FrontendAddrId, ServiceInfo, ServiceKey,
};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::net::IpAddr;
use tracing::{debug, error, warn};

use crate::Index;

#[derive(Default)]
pub struct LoadBalancerTable {
    inner: RwLock<LbTables>,
}

#[derive(Default)]
pub(crate) struct LbTables {
    pub(crate) services: HashMap<ServiceKey, ServiceInfo>,
    pub(crate) endpoints: HashMap<ServiceKey, EndpointsInfo>,
    pub(crate) ingress: HashMap<ServiceKey, ServiceInfo>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Op {
    /// Covers both new and modified joins; installation is idempotent.
    Upsert,
    /// The service side went away; the join is dropped entirely.
    Delete,
    /// Only the endpoints side went away; the service entry is retained so
    /// the next endpoints event rejoins without a resync.
    DeleteBackends,
}

// === impl LoadBalancerTable ===

impl LoadBalancerTable {
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, LbTables> {
        self.inner.write()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, LbTables> {
        self.inner.read()
    }

    pub fn service_count(&self) -> usize {
        self.inner.read().services.len()
    }

    pub fn endpoints_count(&self) -> usize {
        self.inner.read().endpoints.len()
    }
}

// === impl Index: datapath synchronization ===

impl Index {
    /// Reconciles the datapath for one `(namespace, name)` join.
    pub(crate) fn sync_lb(&self, tables: &mut LbTables, key: &ServiceKey, op: Op) -> Result<()> {
        match op {
            Op::Delete => {
                if tables.services.get(key).is_none() {
                    tables.endpoints.remove(key);
                    return Ok(());
                }
                if tables.endpoints.get(key).is_none() {
                    tables.services.remove(key);
                    return Ok(());
                }
                let info = &tables.services[key];
                let eps = &tables.endpoints[key];
                if let Err(error) = self.uninstall_service(key, info, eps) {
                    error!(service = %key, %error, "unable to delete service from the datapath");
                    return Err(error);
                }
                tables.services.remove(key);
                tables.endpoints.remove(key);
                Ok(())
            }

            Op::DeleteBackends => {
                let Some(info) = tables.services.get(key) else {
                    tables.endpoints.remove(key);
                    return Ok(());
                };
                let Some(eps) = tables.endpoints.get(key) else {
                    return Ok(());
                };
                if let Err(error) = self.uninstall_service(key, info, eps) {
                    error!(service = %key, %error, "unable to delete service from the datapath");
                    return Err(error);
                }
                tables.endpoints.remove(key);
                Ok(())
            }

            Op::Upsert => {
                let Some(info) = tables.services.get(key) else {
                    return Ok(());
                };
                let Some(eps) = tables.endpoints.get(key) else {
                    return Ok(());
                };
                let mut info = info.clone();
                let res = self.install_service(key, &mut info, eps);
                // Allocated frontend ids are kept even when installation
                // failed part way, so the next reconcile reuses them.
                tables.services.insert(key.clone(), info);
                res.map_err(|error| {
                    error!(service = %key, %error, "unable to add service to the datapath");
                    error
                })
            }
        }
    }

    /// Reconciles the datapath entries fronted by an ingress for one
    /// `(namespace, name)` join.
    pub(crate) fn sync_external_lb(
        &self,
        tables: &mut LbTables,
        key: &ServiceKey,
        op: Op,
    ) -> Result<()> {
        let Some(info) = tables.ingress.get(key) else {
            return Ok(());
        };
        let Some(eps) = tables.endpoints.get(key) else {
            return Ok(());
        };
        match op {
            Op::Upsert => {
                let mut info = info.clone();
                let res = self.install_service(key, &mut info, eps);
                tables.ingress.insert(key.clone(), info);
                res
            }
            Op::Delete | Op::DeleteBackends => self.uninstall_service(key, info, eps),
        }
    }

    /// Installs one frontend per unique port number, pairing every backend
    /// address with the endpoints' port of the same name.
    fn install_service(
        &self,
        key: &ServiceKey,
        info: &mut ServiceInfo,
        eps: &EndpointsInfo,
    ) -> Result<()> {
        if self.config.disable_service_sync {
            return Ok(());
        }
        // Headless services have no datapath representation.
        if info.headless {
            return Ok(());
        }
        let Some(frontend_ip) = info.frontend_ip else {
            return Ok(());
        };
        check_ip_families(&self.config, key, frontend_ip, eps)?;

        let mut seen_ports = HashSet::new();
        for (port_name, fport) in info.ports.iter_mut() {
            // Protocol collisions on the same port share one entry.
            if !seen_ports.insert(fport.l4.port) {
                continue;
            }

            if fport.id == 0 {
                let addr = FrontendAddr {
                    ip: frontend_ip,
                    l4: fport.l4,
                };
                match self.datapath.acquire_service_id(&addr) {
                    Ok(id) => fport.id = id,
                    Err(error) => {
                        error!(
                            service = %key,
                            port = fport.l4.port,
                            %error,
                            "unable to allocate a frontend id; skipping port"
                        );
                        continue;
                    }
                }
            }

            // An empty backend list still publishes the frontend.
            let backends: Vec<Backend> = match eps.ports.get(port_name) {
                Some(be_port) => eps
                    .backend_ips
                    .iter()
                    .map(|ip| Backend {
                        ip: *ip,
                        l4: *be_port,
                    })
                    .collect(),
                None => Vec::new(),
            };

            let frontend = FrontendAddrId {
                addr: FrontendAddr {
                    ip: frontend_ip,
                    l4: fport.l4,
                },
                id: fport.id,
            };
            if let Err(error) = self.datapath.upsert_service(frontend, backends, true) {
                error!(service = %key, frontend = %frontend.addr, %error, "error while inserting service into the datapath");
            } else {
                debug!(service = %key, frontend = %frontend.addr, "installed service frontend");
            }
        }
        Ok(())
    }

    /// Mirror of [`Index::install_service`].
    pub(crate) fn uninstall_service(
        &self,
        key: &ServiceKey,
        info: &ServiceInfo,
        eps: &EndpointsInfo,
    ) -> Result<()> {
        if self.config.disable_service_sync {
            return Ok(());
        }
        if info.headless {
            return Ok(());
        }
        let Some(frontend_ip) = info.frontend_ip else {
            return Ok(());
        };
        check_ip_families(&self.config, key, frontend_ip, eps)?;

        let mut seen_ports = HashSet::new();
        for fport in info.ports.values() {
            if !seen_ports.insert(fport.l4.port) {
                continue;
            }

            if fport.id != 0 {
                if let Err(error) = self.datapath.release_service_id(fport.id) {
                    warn!(service = %key, id = fport.id, %error, "error while releasing a frontend id");
                }
            }

            let addr = FrontendAddr {
                ip: frontend_ip,
                l4: fport.l4,
            };
            if let Err(error) = self.datapath.delete_service(&addr) {
                warn!(service = %key, frontend = %addr, %error, "error deleting service by frontend");
            }
            if let Err(error) = self.datapath.delete_rev_nat(fport.id) {
                warn!(service = %key, id = fport.id, %error, "error deleting reverse NAT");
            }
        }
        Ok(())
    }
}

/// The frontend family must match the enabled family and every backend.
/// Mixed-family joins are rejected outright so no partial state reaches the
/// datapath.
fn check_ip_families(
    config: &Config,
    key: &ServiceKey,
    frontend_ip: IpAddr,
    eps: &EndpointsInfo,
) -> Result<()> {
    if frontend_ip.is_ipv4() {
        if config.ipv4_disabled {
            bail!("received an IPv4 service {} but IPv4 is disabled", key);
        }
        if let Some(ip) = eps.backend_ips.iter().find(|ip| !ip.is_ipv4()) {
            bail!(
                "backend {} of IPv4 service {} is not IPv4; ignoring service",
                ip,
                key
            );
        }
    } else if let Some(ip) = eps.backend_ips.iter().find(|ip| ip.is_ipv4()) {
        bail!(
            "backend {} of IPv6 service {} is not IPv6; ignoring service",
            ip,
            key
        );
    }
    Ok(())
}
