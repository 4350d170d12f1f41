//! Watcher orchestration.
//!
//! [`start`] wires one controller per watched resource kind into the shared
//! [`Index`], gated on the API server version: the server version is
//! fetched and checked, the policy CRD installed, and the controllers
//! started in a fixed order. The returned future resolves once the
//! policy-bearing controllers have completed their initial lists; the
//! daemon must not serve traffic before then.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod groups;
mod version;

pub use self::groups::ApiGroups;

use anyhow::{bail, Context, Result};
use knet_agent_core::{Config, Datapath, EndpointManager, IpIdentityCache, NodeTable, PolicyEngine};
use knet_agent_k8s_api::{
    Api, Client, CustomResourceDefinition, CustomResourceExt, Endpoints, Ingress,
    KnetNetworkPolicy, Namespace, NetworkPolicy, Node, Pod, PostParams, Service,
};
use knet_agent_k8s_index::{
    endpoints_field_selector, ApiIngressStatusClient, Index, IndexParams,
};
use knet_agent_k8s_status::ApiPolicyStatusClient;
use knet_agent_k8s_watch::{ApiClient, Controller, ErrorSink, EventHandler, Store, WatchMetrics};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, info_span, Instrument};

/// How long the initial list of a gating resource may take before startup
/// is aborted.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(3 * 60);

pub const API_GROUP_CRD: &str = "CustomResourceDefinition";
pub const API_GROUP_NODE: &str = "core/v1::Node";
pub const API_GROUP_NAMESPACE: &str = "core/v1::Namespace";
pub const API_GROUP_SERVICE: &str = "core/v1::Service";
pub const API_GROUP_ENDPOINT: &str = "core/v1::Endpoint";
pub const API_GROUP_POD: &str = "core/v1::Pods";
pub const API_GROUP_NETWORK_POLICY: &str = "networking.k8s.io/v1::NetworkPolicy";
pub const API_GROUP_INGRESS: &str = "networking.k8s.io/v1::Ingress";
pub const API_GROUP_KNET_V2: &str = "knet.io/v2::KnetNetworkPolicy";

/// External collaborators the reconciliation engine is wired to.
pub struct Params {
    pub config: Arc<Config>,
    pub policy: Arc<dyn PolicyEngine>,
    pub datapath: Arc<dyn Datapath>,
    pub endpoints: Arc<dyn EndpointManager>,
    pub ipcache: Arc<IpIdentityCache>,
    pub nodes: Arc<NodeTable>,
}

/// Handles to the running watcher.
pub struct Watcher {
    pub index: Arc<Index>,
    pub api_groups: Arc<ApiGroups>,
}

/// Starts every resource controller and blocks until the policy, service,
/// endpoints and cluster-policy caches have synced.
///
/// Failures here are fatal to the daemon: without the initial state the
/// agent would enforce against an empty world.
pub async fn start(
    client: Client,
    params: Params,
    prom: &mut Registry,
    shutdown: drain::Watch,
) -> Result<Watcher> {
    let server_version = version::server_version(&client)
        .await
        .context("unable to retrieve the server version")?;
    if !version::matches(version::MIN_SUPPORTED, &server_version) {
        bail!(
            "unsupported server version {}; minimal supported version is {}",
            server_version,
            version::MIN_SUPPORTED
        );
    }
    info!(%server_version, "enabling cluster event listener");

    let api_groups = Arc::new(ApiGroups::default());

    ensure_policy_crd(&client)
        .await
        .context("unable to create the policy custom resource definition")?;
    api_groups.add(API_GROUP_CRD);
    api_groups.add(API_GROUP_KNET_V2);

    let metrics = WatchMetrics::register(prom);
    let errors = Arc::new(ErrorSink::new());
    let policy_store = Store::new();

    let use_status_subresource = version::matches(version::STATUS_SUBRESOURCE, &server_version);
    let index = Index::new(
        IndexParams {
            config: params.config.clone(),
            policy: params.policy,
            datapath: params.datapath,
            endpoints: params.endpoints,
            ipcache: params.ipcache,
            nodes: params.nodes,
            policy_store: policy_store.clone(),
            policy_status: Arc::new(ApiPolicyStatusClient::new(
                client.clone(),
                use_status_subresource,
            )),
            ingress_status: Arc::new(ApiIngressStatusClient::new(client.clone())),
        },
        shutdown.clone(),
    );

    let resync = params.config.resync_period;
    let spawner = Spawner {
        client: &client,
        index: &index,
        metrics,
        errors,
        resync,
        shutdown: &shutdown,
    };

    // Gating controllers first, in the order their state is depended upon.
    let mut gates = Vec::new();
    if version::matches(version::NETWORK_POLICY, &server_version) {
        let synced = spawner.spawn::<NetworkPolicy>("NetworkPolicy", None, Store::new());
        gates.push(("NetworkPolicy", synced));
        api_groups.add(API_GROUP_NETWORK_POLICY);
    }

    let synced = spawner.spawn::<Service>("Service", None, Store::new());
    gates.push(("Service", synced));
    api_groups.add(API_GROUP_SERVICE);

    let synced =
        spawner.spawn::<Endpoints>("Endpoint", Some(endpoints_field_selector()), Store::new());
    gates.push(("Endpoint", synced));
    api_groups.add(API_GROUP_ENDPOINT);

    if params.config.enable_external_lb {
        let _synced = spawner.spawn::<Ingress>("Ingress", None, Store::new());
        api_groups.add(API_GROUP_INGRESS);
    }

    let synced = spawner.spawn::<KnetNetworkPolicy>("KnetNetworkPolicy", None, policy_store);
    gates.push(("KnetNetworkPolicy", synced));

    let _synced = spawner.spawn::<Pod>("Pod", None, Store::new());
    api_groups.add(API_GROUP_POD);

    let _synced = spawner.spawn::<Node>("Node", None, Store::new());
    api_groups.add(API_GROUP_NODE);

    let _synced = spawner.spawn::<Namespace>("Namespace", None, Store::new());
    api_groups.add(API_GROUP_NAMESPACE);

    await_cache_sync(gates).await?;

    Ok(Watcher { index, api_groups })
}

struct Spawner<'a> {
    client: &'a Client,
    index: &'a Arc<Index>,
    metrics: WatchMetrics,
    errors: Arc<ErrorSink>,
    resync: Duration,
    shutdown: &'a drain::Watch,
}

impl Spawner<'_> {
    fn spawn<K>(
        &self,
        resource: &'static str,
        field_selector: Option<String>,
        store: Store<K>,
    ) -> watch::Receiver<bool>
    where
        K: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
        K: serde::de::DeserializeOwned,
        K::DynamicType: Default,
        Index: EventHandler<K>,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let (controller, synced) = Controller::new(
            resource,
            ApiClient::new(api, field_selector),
            self.index.clone(),
            store,
            self.resync,
            self.metrics.clone(),
            self.errors.clone(),
        );
        tokio::spawn(
            controller
                .run(self.shutdown.clone())
                .instrument(info_span!("watch", %resource)),
        );
        synced
    }
}

/// Installs the policy CRD, tolerating a pre-existing definition.
async fn ensure_policy_crd(client: &Client) -> Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    match api
        .create(&PostParams::default(), &KnetNetworkPolicy::crd())
        .await
    {
        Ok(_) => {
            info!("created the KnetNetworkPolicy custom resource definition");
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 409 => {
            debug!("the KnetNetworkPolicy custom resource definition is already installed");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

/// Blocks until every gated controller has delivered its initial list.
async fn await_cache_sync(gates: Vec<(&'static str, watch::Receiver<bool>)>) -> Result<()> {
    for (resource, mut synced) in gates {
        debug!(%resource, "waiting for cache to synchronize");
        time::timeout(CACHE_SYNC_TIMEOUT, synced.wait_for(|synced| *synced))
            .await
            .map_err(|_| {
                anyhow::anyhow!("timed out waiting for the initial {} list", resource)
            })?
            .map_err(|_| {
                anyhow::anyhow!("the {} controller terminated before syncing", resource)
            })?;
        debug!(%resource, "cache synced");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn cache_sync_times_out() {
        let (_tx, rx) = watch::channel(false);
        let err = await_cache_sync(vec![("Service", rx)]).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cache_sync_completes() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        await_cache_sync(vec![("Service", rx)]).await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cache_sync_fails_on_dead_controllers() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let err = await_cache_sync(vec![("Service", rx)]).await.unwrap_err();
        assert!(err.to_string().contains("terminated"));
    }
}
