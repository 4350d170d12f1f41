use ahash::AHashMap as HashMap;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::sync::Arc;

/// Identifies a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

/// The controller-maintained cache of the most recently observed object per
/// key. It supplies the prior object for update events and serves reads by
/// long-lived tasks, e.g. the policy status write-back.
pub struct Store<K>(Arc<RwLock<HashMap<ObjectKey, K>>>);

// === impl ObjectKey ===

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: kube::Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Store ===

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(HashMap::default())))
    }
}

impl<K: Clone> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<K> {
        self.0.read().get(key).cloned()
    }

    pub fn insert(&self, key: ObjectKey, obj: K) -> Option<K> {
        self.0.write().insert(key, obj)
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        self.0.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}
