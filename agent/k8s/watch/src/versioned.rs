use ahash::AHashMap as HashMap;
use kube::ResourceExt;

/// An object captured from a list snapshot together with its resource
/// version.
#[derive(Clone, Debug)]
pub struct VersionedObject<K> {
    pub data: K,
    pub version: u64,
}

/// A keyed snapshot of one resource kind, keyed by object uid.
///
/// Built during resync; the missing predicates reduce a snapshot to the
/// subset that is not reflected in local state so it can be replayed as
/// synthetic adds.
#[derive(Clone, Debug)]
pub struct VersionedMap<K> {
    entries: HashMap<String, VersionedObject<K>>,
}

// === impl VersionedMap ===

impl<K> Default for VersionedMap<K> {
    fn default() -> Self {
        Self {
            entries: HashMap::default(),
        }
    }
}

impl<K> VersionedMap<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object under its uid, keeping the highest version on
    /// conflict.
    pub fn add(&mut self, uid: String, obj: VersionedObject<K>) {
        match self.entries.get(&uid) {
            Some(existing) if existing.version >= obj.version => {}
            _ => {
                self.entries.insert(uid, obj);
            }
        }
    }

    pub fn get(&self, uid: &str) -> Option<&VersionedObject<K>> {
        self.entries.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VersionedObject<K>)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: kube::Resource> VersionedMap<K> {
    /// Captures an object under its own uid and resource version.
    pub fn insert_resource(&mut self, obj: K) {
        let uid = obj.uid().unwrap_or_default();
        let version = parse_version(obj.resource_version().as_deref());
        self.add(uid, VersionedObject { data: obj, version });
    }
}

impl<K> IntoIterator for VersionedMap<K> {
    type Item = (String, VersionedObject<K>);
    type IntoIter = <HashMap<String, VersionedObject<K>> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Resource versions are opaque strings, but ordering them numerically is
/// reliable for the snapshots a single list produces.
fn parse_version(version: Option<&str>) -> u64 {
    version.and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_keeps_highest_version() {
        let mut map = VersionedMap::new();
        map.add(
            "uid-1".to_string(),
            VersionedObject {
                data: "new",
                version: 7,
            },
        );
        map.add(
            "uid-1".to_string(),
            VersionedObject {
                data: "stale",
                version: 3,
            },
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("uid-1").unwrap().data, "new");

        map.add(
            "uid-1".to_string(),
            VersionedObject {
                data: "newest",
                version: 9,
            },
        );
        assert_eq!(map.get("uid-1").unwrap().data, "newest");
    }

    #[test]
    fn missing_versions_order_first() {
        assert_eq!(parse_version(None), 0);
        assert_eq!(parse_version(Some("x")), 0);
        assert_eq!(parse_version(Some("42")), 42);
    }
}
