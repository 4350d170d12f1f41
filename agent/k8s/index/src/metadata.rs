//! Import metadata caches.
//!
//! The policy cache records, per policy object, the repository revision and
//! error of the most recent import; it is written synchronously inside the
//! add path so that an immediately-following update event observes the
//! revision. The endpoint cache records the outcome of the most recent
//! `toServices` rule translation per endpoints object.

use ahash::AHashMap as HashMap;
use knet_agent_core::ServiceKey;
use knet_agent_k8s_watch::ObjectKey;
use parking_lot::RwLock;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyImportMeta {
    pub revision: u64,
    pub error: Option<String>,
}

#[derive(Default)]
pub struct PolicyImportCache {
    entries: RwLock<HashMap<ObjectKey, PolicyImportMeta>>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct EndpointImportMeta {
    pub(crate) translation_error: Option<String>,
}

#[derive(Default)]
pub struct EndpointImportCache {
    entries: RwLock<HashMap<ServiceKey, EndpointImportMeta>>,
}

// === impl PolicyImportCache ===

impl PolicyImportCache {
    pub fn upsert(&self, key: &ObjectKey, revision: u64, error: Option<String>) {
        self.entries
            .write()
            .insert(key.clone(), PolicyImportMeta { revision, error });
    }

    pub fn get(&self, key: &ObjectKey) -> Option<PolicyImportMeta> {
        self.entries.read().get(key).cloned()
    }

    pub fn delete(&self, key: &ObjectKey) {
        self.entries.write().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// === impl EndpointImportCache ===

impl EndpointImportCache {
    pub(crate) fn upsert(&self, key: &ServiceKey, translation_error: Option<String>) {
        self.entries
            .write()
            .insert(key.clone(), EndpointImportMeta { translation_error });
    }

    pub(crate) fn get(&self, key: &ServiceKey) -> Option<EndpointImportMeta> {
        self.entries.read().get(key).cloned()
    }

    pub(crate) fn delete(&self, key: &ServiceKey) {
        self.entries.write().remove(key);
    }
}
