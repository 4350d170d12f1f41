use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use knet_agent_core::EndpointManager;
use knet_agent_k8s_api::{
    Api, KnetNetworkPolicy, PolicyNodeStatus, PostParams, ResourceExt,
};
use knet_agent_k8s_watch::{ObjectKey, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// How long a status task waits for local endpoints to reach the import
/// revision before reporting the policy as not enforced.
pub const ENDPOINT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

const UPDATE_MAX_ATTEMPTS: usize = 5;
const UPDATE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Writes a policy object's status back to the API server.
#[async_trait]
pub trait PolicyStatusClient: Send + Sync + 'static {
    async fn update_status(&self, policy: &KnetNetworkPolicy) -> Result<()>;
}

/// [`PolicyStatusClient`] backed by the cluster API. Server versions that
/// support the status subresource get a status-only write; older servers
/// get a whole-object update.
pub struct ApiPolicyStatusClient {
    client: kube::Client,
    use_subresource: bool,
}

/// Builds and publishes this node's per-policy enforcement status.
pub struct StatusSync {
    client: Arc<dyn PolicyStatusClient>,
    store: Store<KnetNetworkPolicy>,
    endpoints: Arc<dyn EndpointManager>,
    node_name: String,
}

// === impl ApiPolicyStatusClient ===

impl ApiPolicyStatusClient {
    pub fn new(client: kube::Client, use_subresource: bool) -> Self {
        Self {
            client,
            use_subresource,
        }
    }
}

#[async_trait]
impl PolicyStatusClient for ApiPolicyStatusClient {
    async fn update_status(&self, policy: &KnetNetworkPolicy) -> Result<()> {
        let namespace = policy
            .namespace()
            .ok_or_else(|| anyhow!("policy is missing a namespace"))?;
        let name = policy.name_unchecked();
        let api: Api<KnetNetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);
        if self.use_subresource {
            api.replace_status(&name, &PostParams::default(), serde_json::to_vec(policy)?)
                .await?;
        } else {
            api.replace(&name, &PostParams::default(), policy).await?;
        }
        Ok(())
    }
}

// === impl StatusSync ===

impl StatusSync {
    pub fn new(
        client: Arc<dyn PolicyStatusClient>,
        store: Store<KnetNetworkPolicy>,
        endpoints: Arc<dyn EndpointManager>,
        node_name: String,
    ) -> Self {
        Self {
            client,
            store,
            endpoints,
            node_name,
        }
    }

    /// One run of a policy's status task.
    ///
    /// Waits for endpoint convergence, re-reads the policy from the local
    /// cache and writes this node's status entry, retrying version
    /// conflicts and other write failures a bounded number of times. The
    /// convergence error, if any, is returned only once a write succeeded,
    /// so the task is retried until the policy is actually enforced.
    pub async fn run(
        &self,
        key: &ObjectKey,
        revision: u64,
        import_error: Option<String>,
    ) -> Result<()> {
        let wait_error: Option<String> = time::timeout(
            ENDPOINT_CONVERGENCE_TIMEOUT,
            self.endpoints.wait_for_policy_revision(revision),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow!(
                "endpoints did not reach policy revision {} within {:?}",
                revision,
                ENDPOINT_CONVERGENCE_TIMEOUT
            ))
        })
        .err()
        .map(|e| e.to_string());

        let mut last_write_error = None;
        for attempt in 0..UPDATE_MAX_ATTEMPTS {
            if attempt > 0 {
                time::sleep(UPDATE_RETRY_DELAY).await;
            }

            // Always status the freshest copy of the policy: the object may
            // have been rewritten since this task was scheduled.
            let Some(mut policy) = self.store.get(key) else {
                bail!("policy {} is no longer in the local cache", key);
            };
            let parse_error = policy.parse_rules().err();
            if let Some(error) = &parse_error {
                warn!(policy = %key, %error, "cached policy no longer parses");
            }

            let status = self.node_status(&policy, revision, &import_error, &parse_error, &wait_error);
            policy.set_node_status(&self.node_name, status);

            match self.client.update_status(&policy).await {
                Ok(()) => {
                    debug!(policy = %key, "updated policy node status");
                    return match wait_error {
                        None => Ok(()),
                        Some(message) => Err(anyhow!(message)),
                    };
                }
                Err(error) => {
                    warn!(
                        policy = %key,
                        %error,
                        "policy status update failed; retrying in {:?}",
                        UPDATE_RETRY_DELAY
                    );
                    last_write_error = Some(error);
                }
            }
        }

        Err(last_write_error
            .unwrap_or_else(|| anyhow!("no attempts made"))
            .context(format!("giving up on status update for {}", key)))
    }

    fn node_status(
        &self,
        policy: &KnetNetworkPolicy,
        revision: u64,
        import_error: &Option<String>,
        parse_error: &Option<anyhow::Error>,
        wait_error: &Option<String>,
    ) -> PolicyNodeStatus {
        let annotations = policy.metadata.annotations.clone();
        let last_updated = Utc::now();

        // An import or parse failure means the policy is neither OK nor
        // enforced. A converged import is enforcing; one still waiting on
        // endpoints is OK but not yet enforcing.
        let (enforcing, ok, error) = if let Some(e) = import_error {
            (false, false, Some(e.clone()))
        } else if let Some(e) = parse_error {
            (false, false, Some(e.to_string()))
        } else if let Some(e) = wait_error {
            (false, true, Some(e.clone()))
        } else {
            (true, true, None)
        };

        PolicyNodeStatus {
            enforcing,
            ok,
            revision: error.is_none().then_some(revision),
            error,
            last_updated,
            annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knet_agent_core::{Endpoint, Rule};
    use knet_agent_k8s_api::{KnetNetworkPolicySpec, ObjectMeta};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct MockStatusClient {
        fail_attempts: Mutex<usize>,
        written: Mutex<Vec<KnetNetworkPolicy>>,
    }

    #[async_trait]
    impl PolicyStatusClient for MockStatusClient {
        async fn update_status(&self, policy: &KnetNetworkPolicy) -> Result<()> {
            let mut failures = self.fail_attempts.lock();
            if *failures > 0 {
                *failures -= 1;
                bail!("Operation cannot be fulfilled: the object has been modified");
            }
            self.written.lock().push(policy.clone());
            Ok(())
        }
    }

    struct MockEndpoints {
        converged_revision: AtomicU64,
    }

    #[async_trait]
    impl EndpointManager for MockEndpoints {
        fn lookup_pod(&self, _namespace: &str, _name: &str) -> Option<Arc<dyn Endpoint>> {
            None
        }

        fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
            Vec::new()
        }

        async fn wait_for_policy_revision(&self, revision: u64) -> Result<()> {
            if self.converged_revision.load(Ordering::SeqCst) >= revision {
                Ok(())
            } else {
                futures::future::pending().await
            }
        }
    }

    fn mk_policy() -> KnetNetworkPolicy {
        KnetNetworkPolicy {
            metadata: ObjectMeta {
                name: Some("p1".to_string()),
                namespace: Some("app".to_string()),
                uid: Some("u1".to_string()),
                annotations: Some([("team".to_string(), "web".to_string())].into()),
                ..Default::default()
            },
            spec: KnetNetworkPolicySpec {
                rule: Some(Rule::default()),
                rules: None,
            },
            status: None,
        }
    }

    fn mk_sync(
        converged: u64,
        fail_attempts: usize,
    ) -> (StatusSync, Arc<MockStatusClient>, Store<KnetNetworkPolicy>) {
        let client = Arc::new(MockStatusClient {
            fail_attempts: Mutex::new(fail_attempts),
            ..Default::default()
        });
        let store = Store::new();
        let sync = StatusSync::new(
            client.clone(),
            store.clone(),
            Arc::new(MockEndpoints {
                converged_revision: AtomicU64::new(converged),
            }),
            "node-1".to_string(),
        );
        (sync, client, store)
    }

    fn key() -> ObjectKey {
        ObjectKey::new("app", "p1")
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn converged_policy_is_reported_enforcing() {
        let (sync, client, store) = mk_sync(7, 0);
        store.insert(key(), mk_policy());

        sync.run(&key(), 7, None).await.unwrap();

        let written = client.written.lock();
        let status = &written[0].status.as_ref().unwrap().nodes["node-1"];
        assert!(status.enforcing);
        assert!(status.ok);
        assert_eq!(status.revision, Some(7));
        assert_eq!(status.error, None);
        assert_eq!(
            status.annotations.as_ref().unwrap()["team"],
            "web",
            "current annotations are carried into the status"
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn import_errors_are_surfaced() {
        let (sync, client, store) = mk_sync(7, 0);
        store.insert(key(), mk_policy());

        sync.run(&key(), 0, Some("bad selector".to_string()))
            .await
            .unwrap();

        let written = client.written.lock();
        let status = &written[0].status.as_ref().unwrap().nodes["node-1"];
        assert!(!status.enforcing);
        assert!(!status.ok);
        assert_eq!(status.revision, None);
        assert_eq!(status.error.as_deref(), Some("bad selector"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unconverged_endpoints_are_reported_and_returned() {
        let (sync, client, store) = mk_sync(3, 0);
        store.insert(key(), mk_policy());

        // Revision 9 is never reached; the write succeeds but the wait
        // error is surfaced so the task retries.
        let err = sync.run(&key(), 9, None).await.unwrap_err();
        assert!(err.to_string().contains("did not reach policy revision 9"));

        let written = client.written.lock();
        let status = &written[0].status.as_ref().unwrap().nodes["node-1"];
        assert!(!status.enforcing);
        assert!(status.ok);
        assert!(status.error.as_deref().unwrap().contains("revision 9"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn write_conflicts_are_retried() {
        let (sync, client, store) = mk_sync(7, 2);
        store.insert(key(), mk_policy());

        sync.run(&key(), 7, None).await.unwrap();
        assert_eq!(client.written.lock().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn write_failures_are_bounded() {
        let (sync, client, store) = mk_sync(7, 100);
        store.insert(key(), mk_policy());

        let err = sync.run(&key(), 7, None).await.unwrap_err();
        assert!(err.to_string().contains("giving up"));
        assert!(client.written.lock().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn missing_policies_error_for_retry() {
        let (sync, client, _store) = mk_sync(7, 0);

        let err = sync.run(&key(), 7, None).await.unwrap_err();
        assert!(err.to_string().contains("no longer in the local cache"));
        assert!(client.written.lock().is_empty());
    }
}
