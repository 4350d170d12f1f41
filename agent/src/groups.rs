use ahash::AHashSet as HashSet;
use parking_lot::RwLock;

/// The set of API groups the watcher is consuming, published through the
/// daemon's status endpoints.
#[derive(Default)]
pub struct ApiGroups {
    inner: RwLock<HashSet<String>>,
}

// === impl ApiGroups ===

impl ApiGroups {
    pub fn add(&self, api: &str) {
        self.inner.write().insert(api.to_string());
    }

    pub fn remove(&self, api: &str) {
        self.inner.write().remove(api);
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.inner.read().iter().cloned().collect();
        groups.sort();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_are_deduplicated_and_sorted() {
        let groups = ApiGroups::default();
        groups.add("core/v1::Service");
        groups.add("core/v1::Endpoint");
        groups.add("core/v1::Service");
        assert_eq!(
            groups.groups(),
            vec!["core/v1::Endpoint".to_string(), "core/v1::Service".to_string()]
        );

        groups.remove("core/v1::Endpoint");
        assert_eq!(groups.groups(), vec!["core/v1::Service".to_string()]);
    }
}
