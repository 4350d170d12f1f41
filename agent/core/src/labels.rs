//! Identity labels and label selectors.
//!
//! Rules and workload identities are keyed by sets of sourced labels. Labels
//! derived from the orchestrator carry the `k8s` source; keys that can never
//! contribute to identity (deployment bookkeeping, rollout hashes) are
//! stripped by [`LabelSet::filtered`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Source of labels learned from the orchestrator.
pub const SOURCE_K8S: &str = "k8s";

/// Prefix under which a namespace's own labels are attached to the pods it
/// contains.
pub const NAMESPACE_META_LABELS: &str = "io.knet.k8s.namespace.labels";

/// Label key carrying the namespace a policy rule is scoped to.
pub const NAMESPACE_LABEL: &str = "io.knet.k8s.namespace";

const IGNORED_KEY_PREFIXES: &[&str] = &[
    "kubernetes.io/",
    "k8s.io/",
    "beta.kubernetes.io/",
    "statefulset.kubernetes.io/",
];

const IGNORED_KEYS: &[&str] = &[
    "pod-template-hash",
    "pod-template-generation",
    "controller-revision-hash",
];

pub type Map = BTreeMap<String, String>;

/// A single sourced label.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, JsonSchema,
)]
pub struct Label {
    pub key: String,
    pub value: String,
    #[serde(default = "k8s_source")]
    pub source: String,
}

/// An ordered, deduplicated set of labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct LabelSet(Vec<Label>);

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of labeled objects. The results of `match_labels` and
/// `match_expressions` are ANDed.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

fn k8s_source() -> String {
    SOURCE_K8S.to_string()
}

/// Joins a namespace label key onto the namespace-meta prefix.
pub fn namespace_meta_key(key: &str) -> String {
    format!("{}.{}", NAMESPACE_META_LABELS, key)
}

// === impl Label ===

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>, source: &str) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source: source.to_string(),
        }
    }

    fn is_ignored(&self) -> bool {
        IGNORED_KEYS.iter().any(|k| *k == self.key)
            || IGNORED_KEY_PREFIXES.iter().any(|p| self.key.starts_with(p))
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}={}", self.source, self.key, self.value)
    }
}

// === impl LabelSet ===

impl LabelSet {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup();
        Self(labels)
    }

    /// Builds a label set from an orchestrator label map.
    pub fn from_map(map: &Map, source: &str) -> Self {
        Self::new(
            map.iter()
                .map(|(k, v)| Label::new(k.clone(), v.clone(), source))
                .collect(),
        )
    }

    /// Drops labels that never contribute to workload identity.
    pub fn filtered(&self) -> LabelSet {
        Self(self.0.iter().filter(|l| !l.is_ignored()).cloned().collect())
    }

    /// Indicates whether every label in `other` is present in `self`.
    pub fn contains_all(&self, other: &LabelSet) -> bool {
        other.0.iter().all(|l| self.0.contains(l))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Label> for LabelSet {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl IntoIterator for LabelSet {
    type Item = Label;
    type IntoIter = std::vec::IntoIter<Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl std::fmt::Display for LabelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for label in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", label)?;
            first = false;
        }
        Ok(())
    }
}

// === impl Expression ===

impl Expression {
    pub fn new(key: impl Into<String>, operator: Operator, values: Option<BTreeSet<String>>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match self.operator {
            Operator::In => match labels.get(&self.key) {
                Some(v) => self.values.iter().flatten().any(|e| e == v),
                None => false,
            },
            Operator::NotIn => match labels.get(&self.key) {
                Some(v) => !self.values.iter().flatten().any(|e| e == v),
                None => true,
            },
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

// === impl Selector ===

impl Selector {
    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    /// Indicates whether this selector matches all objects.
    pub fn selects_all(&self) -> bool {
        match (self.match_labels.as_ref(), self.match_expressions.as_ref()) {
            (None, None) => true,
            (Some(l), None) => l.is_empty(),
            (None, Some(e)) => e.is_empty(),
            (Some(l), Some(e)) => l.is_empty() && e.is_empty(),
        }
    }

    pub fn matches(&self, labels: &Map) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }

    /// Adds a required label, e.g. to scope a selector to a namespace.
    pub fn with_match_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.match_labels
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self
    }

    /// ANDs another selector's requirements onto this one.
    pub fn and(mut self, other: Selector) -> Selector {
        if let Some(labels) = other.match_labels {
            self.match_labels
                .get_or_insert_with(Default::default)
                .extend(labels);
        }
        if let Some(exprs) = other.match_expressions {
            self.match_expressions
                .get_or_insert_with(Default::default)
                .extend(exprs);
        }
        self
    }

    /// Rewrites every referenced key, e.g. to move namespace labels under
    /// their dedicated prefix.
    pub fn map_keys(self, f: impl Fn(&str) -> String) -> Selector {
        Selector {
            match_labels: self
                .match_labels
                .map(|m| m.into_iter().map(|(k, v)| (f(&k), v)).collect()),
            match_expressions: self.match_expressions.map(|exprs| {
                exprs
                    .into_iter()
                    .map(|e| Expression {
                        key: f(&e.key),
                        operator: e.operator,
                        values: e.values,
                    })
                    .collect()
            }),
        }
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(labels: &[(&str, &str)]) -> Map {
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn filtered_drops_bookkeeping_keys() {
        let labels = LabelSet::from_map(
            &map(&[
                ("app", "web"),
                ("pod-template-hash", "abc123"),
                ("kubernetes.io/metadata.name", "default"),
            ]),
            SOURCE_K8S,
        );
        let filtered = labels.filtered();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered.get("app"), Some("web"));
    }

    #[test]
    fn contains_all_is_subset() {
        let all = LabelSet::from_map(&map(&[("a", "1"), ("b", "2")]), SOURCE_K8S);
        let sub = LabelSet::from_map(&map(&[("a", "1")]), SOURCE_K8S);
        assert!(all.contains_all(&sub));
        assert!(!sub.contains_all(&all));
        assert!(all.contains_all(&LabelSet::default()));
    }

    #[test]
    fn selector_matches() {
        let sel: Selector = [("app", "web")].into_iter().collect();
        assert!(sel.matches(&map(&[("app", "web"), ("tier", "fe")])));
        assert!(!sel.matches(&map(&[("app", "api")])));
        assert!(Selector::default().selects_all());
    }

    #[test]
    fn selector_expressions() {
        let sel = Selector::from_expressions(vec![Expression {
            key: "env".to_string(),
            operator: Operator::NotIn,
            values: Some(["prod".to_string()].into_iter().collect()),
        }]);
        assert!(sel.matches(&map(&[("env", "dev")])));
        assert!(sel.matches(&map(&[])));
        assert!(!sel.matches(&map(&[("env", "prod")])));
    }
}
