use anyhow::{anyhow, Result};
use async_trait::async_trait;
use knet_agent_k8s_api::KnetNetworkPolicy;
use knet_agent_k8s_watch::{EventHandler, ObjectKey, VersionedMap};
use tracing::{debug, info, warn};

use crate::translate::preprocess_rules;
use crate::Index;

// === impl Index ===

impl Index {
    /// Imports a policy and (re)schedules its status write-back task.
    pub(crate) fn apply_cluster_policy(&self, cnp: &KnetNetworkPolicy) -> Result<()> {
        let key = ObjectKey::from_resource(cnp);
        debug!(policy = %key, "adding cluster policy");

        let imported: Result<u64> = cnp.parse_rules().and_then(|mut rules| {
            {
                // `toServices` references are materialized against the
                // current service tables before import.
                let tables = self.lb.read();
                preprocess_rules(&mut rules, &tables)?;
            }
            self.policy.add_rules(rules, true)
        });

        let (revision, import_error) = match imported {
            Ok(revision) => {
                info!(policy = %key, %revision, "imported cluster policy");
                (revision, None)
            }
            Err(error) => {
                warn!(policy = %key, %error, "unable to import cluster policy");
                (0, Some(error.to_string()))
            }
        };

        // The metadata upsert must complete before this handler returns so
        // that an immediately-following update event observes the revision.
        self.policy_imports
            .upsert(&key, revision, import_error.clone());

        self.schedule_status_sync(cnp, revision, import_error.clone());

        match import_error {
            None => Ok(()),
            Some(message) => Err(anyhow!(message)),
        }
    }

    pub(crate) fn update_cluster_policy(
        &self,
        old: &KnetNetworkPolicy,
        new: &KnetNetworkPolicy,
    ) -> Result<()> {
        if let Err(error) = old.parse_rules() {
            warn!(%error, "error parsing previous cluster policy");
            return Err(error);
        }
        if let Err(error) = new.parse_rules() {
            warn!(%error, "error parsing new cluster policy");
            return Err(error);
        }

        let key = ObjectKey::from_resource(new);
        debug!(policy = %key, "modified cluster policy");

        if old.spec_equals(new) {
            if !old.annotations_equals(new) {
                // The task key can change across updates; cancel the old
                // task first so it does not leak.
                let old_task = old.status_task_name();
                let new_task = new.status_task_name();
                if old_task != new_task {
                    self.status_tasks.remove(&old_task);
                }

                // The revision is always populated here: the add path
                // upserts the metadata cache before any update for the same
                // policy is handled.
                let meta = self.policy_imports.get(&key).unwrap_or_default();
                info!(policy = %key, "updating node status for annotations-only policy change");
                self.schedule_status_sync(new, meta.revision, meta.error);
            }
            return Ok(());
        }

        self.apply_cluster_policy(new)
    }

    pub(crate) fn delete_cluster_policy(&self, cnp: &KnetNetworkPolicy) -> Result<()> {
        let key = ObjectKey::from_resource(cnp);
        debug!(policy = %key, "deleting cluster policy");

        self.policy_imports.delete(&key);
        self.status_tasks.remove(&cnp.status_task_name());

        let labels = cnp.rule_labels()?;
        match self.policy.delete_rules(&labels) {
            Ok(_) => {
                info!(policy = %key, "deleted cluster policy");
                Ok(())
            }
            Err(error) => {
                warn!(policy = %key, %error, "unable to delete cluster policy");
                Err(error)
            }
        }
    }

    fn schedule_status_sync(
        &self,
        cnp: &KnetNetworkPolicy,
        revision: u64,
        import_error: Option<String>,
    ) {
        let key = ObjectKey::from_resource(cnp);
        let sync = self.status_sync.clone();
        self.status_tasks.upsert(cnp.status_task_name(), move || {
            let sync = sync.clone();
            let key = key.clone();
            let import_error = import_error.clone();
            async move { sync.run(&key, revision, import_error).await }
        });
    }
}

#[async_trait]
impl EventHandler<KnetNetworkPolicy> for Index {
    async fn on_add(&self, cnp: KnetNetworkPolicy) -> Result<()> {
        self.apply_cluster_policy(&cnp)
    }

    async fn on_update(&self, old: KnetNetworkPolicy, new: KnetNetworkPolicy) -> Result<()> {
        self.update_cluster_policy(&old, &new)
    }

    async fn on_delete(&self, cnp: KnetNetworkPolicy) -> Result<()> {
        self.delete_cluster_policy(&cnp)
    }

    /// Annotation changes must be delivered: they are carried into the
    /// per-node status even when the spec is untouched.
    fn unchanged(&self, old: &KnetNetworkPolicy, new: &KnetNetworkPolicy) -> bool {
        old.metadata.name == new.metadata.name
            && old.metadata.namespace == new.metadata.namespace
            && old.spec_equals(new)
            && old.annotations_equals(new)
    }

    fn missing(
        &self,
        snapshot: &VersionedMap<KnetNetworkPolicy>,
    ) -> VersionedMap<KnetNetworkPolicy> {
        let mut missing = VersionedMap::new();
        for (uid, obj) in snapshot.iter() {
            let Ok(labels) = obj.data.rule_labels() else {
                continue;
            };
            if !self.policy.contains_all(&[labels]) {
                missing.add(uid.clone(), obj.clone());
            }
        }
        missing
    }
}
