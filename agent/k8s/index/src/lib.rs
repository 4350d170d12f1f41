//! Reconciliation of watched cluster resources into the agent's local
//! subsystems.
//!
//! The [`Index`] is the daemon-owned context shared by every resource
//! controller. Each resource kind gets an [`EventHandler`] implementation
//! in its own module, in terms of the subsystems the index holds:
//!
//! - Services, Endpoints and Ingresses join into the load-balancer table
//!   and drive datapath frontends/backends.
//! - NetworkPolicy and KnetNetworkPolicy objects import into the policy
//!   repository; the latter also feed the per-node status write-back.
//! - Pods, Namespaces and Nodes join into the ip-identity cache, endpoint
//!   identity labels and the node/tunneling table.
//!
//! Handlers are idempotent and best-effort; the controllers' missing
//! predicates re-deliver anything a failed handler left out of the tables.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_policy;
mod endpoints;
mod ingress;
mod lb;
mod metadata;
mod namespace;
mod network_policy;
mod node;
mod pod;
mod service;
mod translate;


pub use self::endpoints::endpoints_field_selector;
pub use self::ingress::{ApiIngressStatusClient, IngressStatusClient};
pub use self::lb::LoadBalancerTable;
pub use self::metadata::{EndpointImportCache, PolicyImportCache, PolicyImportMeta};

use knet_agent_core::{
    Config, Datapath, EndpointManager, IpIdentityCache, NodeTable, PolicyEngine,
};
use knet_agent_k8s_api::KnetNetworkPolicy;
use knet_agent_k8s_status::{PolicyStatusClient, StatusSync, StatusTasks};
use knet_agent_k8s_watch::Store;
use std::sync::Arc;
use std::time::Duration;

/// Delay before a failed policy status task is run again.
const STATUS_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Everything the index reconciles against.
pub struct IndexParams {
    pub config: Arc<Config>,
    pub policy: Arc<dyn PolicyEngine>,
    pub datapath: Arc<dyn Datapath>,
    pub endpoints: Arc<dyn EndpointManager>,
    pub ipcache: Arc<IpIdentityCache>,
    pub nodes: Arc<NodeTable>,

    /// The KnetNetworkPolicy controller's cache; status tasks re-read
    /// policies from it.
    pub policy_store: Store<KnetNetworkPolicy>,
    pub policy_status: Arc<dyn PolicyStatusClient>,
    pub ingress_status: Arc<dyn IngressStatusClient>,
}

/// Shared reconciliation context. All contained subsystems carry their own
/// locks, so handlers borrow the index immutably from concurrent
/// controllers.
pub struct Index {
    pub(crate) config: Arc<Config>,
    pub(crate) policy: Arc<dyn PolicyEngine>,
    pub(crate) datapath: Arc<dyn Datapath>,
    pub(crate) endpoints: Arc<dyn EndpointManager>,
    pub(crate) ipcache: Arc<IpIdentityCache>,
    pub(crate) nodes: Arc<NodeTable>,
    pub(crate) lb: LoadBalancerTable,
    pub(crate) policy_imports: PolicyImportCache,
    pub(crate) endpoint_imports: EndpointImportCache,
    pub(crate) status_tasks: StatusTasks,
    pub(crate) status_sync: Arc<StatusSync>,
    pub(crate) ingress_status: Arc<dyn IngressStatusClient>,
}

// === impl Index ===

impl Index {
    pub fn new(params: IndexParams, shutdown: drain::Watch) -> Arc<Self> {
        let IndexParams {
            config,
            policy,
            datapath,
            endpoints,
            ipcache,
            nodes,
            policy_store,
            policy_status,
            ingress_status,
        } = params;

        let status_sync = Arc::new(StatusSync::new(
            policy_status,
            policy_store,
            endpoints.clone(),
            config.node_name.clone(),
        ));

        Arc::new(Self {
            config,
            policy,
            datapath,
            endpoints,
            ipcache,
            nodes,
            lb: LoadBalancerTable::default(),
            policy_imports: PolicyImportCache::default(),
            endpoint_imports: EndpointImportCache::default(),
            status_tasks: StatusTasks::new(shutdown, STATUS_RETRY_DELAY),
            status_sync,
            ingress_status,
        })
    }

    pub fn load_balancer(&self) -> &LoadBalancerTable {
        &self.lb
    }

    pub fn policy_imports(&self) -> &PolicyImportCache {
        &self.policy_imports
    }
}
