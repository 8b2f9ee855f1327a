//! Shared notebook index backing the ConfigMap watch fan-out
//!
//! The watch mapper runs synchronously and cannot list notebooks from the
//! API, so the reconciler keeps this in-memory view current: which
//! notebooks exist per namespace, and which of them mount the merged
//! trust bundle. Notebooks that have never been reconciled are picked up
//! by the controller's initial sync instead of the mapper.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// Per-notebook state tracked for watch fan-out
#[derive(Clone, Debug, Default)]
pub struct NotebookEntry {
    /// Whether the pod template mounts the merged trust bundle
    pub mounts_trust_bundle: bool,
}

/// Concurrent namespace -> notebook -> entry index
#[derive(Debug, Default)]
pub struct NotebookIndex {
    namespaces: DashMap<String, BTreeMap<String, NotebookEntry>>,
}

impl NotebookIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or update a notebook
    pub fn upsert(&self, namespace: &str, name: &str, mounts_trust_bundle: bool) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(
                name.to_string(),
                NotebookEntry {
                    mounts_trust_bundle,
                },
            );
    }

    /// Drop a notebook, removing the namespace entry when it empties
    pub fn remove(&self, namespace: &str, name: &str) {
        if let Some(mut entry) = self.namespaces.get_mut(namespace) {
            entry.remove(name);
            if entry.is_empty() {
                drop(entry);
                self.namespaces
                    .remove_if(namespace, |_, names| names.is_empty());
            }
        }
    }

    /// One notebook in the namespace, if any.
    ///
    /// A global trust source change affects every notebook in the
    /// namespace equally; reconciling any one of them rebuilds the shared
    /// merged bundle, so a single representative is enough.
    pub fn any_in_namespace(&self, namespace: &str) -> Option<String> {
        self.namespaces
            .get(namespace)
            .and_then(|names| names.keys().next().cloned())
    }

    /// Every notebook in the namespace currently mounting the merged bundle
    pub fn mounting_in_namespace(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .get(namespace)
            .map(|names| {
                names
                    .iter()
                    .filter(|(_, entry)| entry.mounts_trust_bundle)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_remove() {
        let index = NotebookIndex::new();
        index.upsert("team-a", "bench-1", false);
        index.upsert("team-a", "bench-2", true);

        assert!(index.any_in_namespace("team-a").is_some());
        assert_eq!(index.mounting_in_namespace("team-a"), vec!["bench-2"]);

        index.remove("team-a", "bench-2");
        assert!(index.mounting_in_namespace("team-a").is_empty());
        assert_eq!(index.any_in_namespace("team-a"), Some("bench-1".to_string()));

        index.remove("team-a", "bench-1");
        assert!(index.any_in_namespace("team-a").is_none());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let index = NotebookIndex::new();
        index.upsert("team-a", "bench", true);
        index.upsert("team-b", "bench", false);

        assert_eq!(index.mounting_in_namespace("team-a"), vec!["bench"]);
        assert!(index.mounting_in_namespace("team-b").is_empty());
        assert!(index.any_in_namespace("team-c").is_none());
    }

    #[test]
    fn test_upsert_updates_mount_flag() {
        let index = NotebookIndex::new();
        index.upsert("team-a", "bench", false);
        assert!(index.mounting_in_namespace("team-a").is_empty());

        index.upsert("team-a", "bench", true);
        assert_eq!(index.mounting_in_namespace("team-a"), vec!["bench"]);
    }
}
