//! Bidirectional dependency graph.
//!
//! Tracks which entries watch which keys so the store can drop every
//! dependent when a watched key is replaced or removed. The graph has no lock
//! of its own; it lives inside the store's mutex.

use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    /// watched key -> keys of entries depending on it
    dependents: HashMap<String, HashSet<String>>,
    /// dependent key -> keys it watches
    watched_by: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record that `dependent` must be dropped when any of `watched` changes.
    pub(crate) fn register<I>(&mut self, dependent: &str, watched: I)
    where
        I: IntoIterator<Item = String>,
    {
        let watched: HashSet<String> = watched
            .into_iter()
            .filter(|key| key != dependent)
            .collect();
        if watched.is_empty() {
            return;
        }

        for key in &watched {
            self.dependents
                .entry(key.clone())
                .or_default()
                .insert(dependent.to_string());
        }
        self.watched_by
            .entry(dependent.to_string())
            .or_default()
            .extend(watched);
    }

    /// Drop the edges `dependent` holds on the keys it watches.
    pub(crate) fn unregister(&mut self, dependent: &str) {
        let Some(watched) = self.watched_by.remove(dependent) else {
            return;
        };
        for key in watched {
            if let Some(keys) = self.dependents.get_mut(&key) {
                keys.remove(dependent);
                if keys.is_empty() {
                    self.dependents.remove(&key);
                }
            }
        }
    }

    /// Detach and return every entry that depends on `watched`.
    pub(crate) fn take_dependents(&mut self, watched: &str) -> HashSet<String> {
        let affected = self.dependents.remove(watched).unwrap_or_default();
        for dependent in &affected {
            if let Some(keys) = self.watched_by.get_mut(dependent) {
                keys.remove(watched);
                if keys.is_empty() {
                    self.watched_by.remove(dependent);
                }
            }
        }
        affected
    }

    pub(crate) fn dependents_of(&self, watched: &str) -> HashSet<String> {
        self.dependents.get(watched).cloned().unwrap_or_default()
    }

    pub(crate) fn clear(&mut self) {
        self.dependents.clear();
        self.watched_by.clear();
    }

    pub(crate) fn watched_count(&self) -> usize {
        self.dependents.len()
    }

    #[cfg(test)]
    pub(crate) fn dependent_count(&self) -> usize {
        self.watched_by.len()
    }
}
