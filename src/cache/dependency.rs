//! Dependency objects.
//!
//! [`CacheDependency`] is the immutable set of keys and files an entry watches.
//! [`DependencyList`] accumulates keys during one logical operation (one page
//! render, one request) and is flushed into a `CacheDependency` at the end.
//!
//! The request-scoped list uses `tokio::task_local!`, so recording from code
//! that runs outside [`with_dependency_list`] is silently ignored.

use std::cell::RefCell;
use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

tokio::task_local! {
    static DEPENDENCIES: RefCell<DependencyList>;
}

/// Keys and files an entry depends on, captured at creation time.
///
/// Keys are lowercased and de-duplicated in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheDependency {
    cache_keys: Vec<String>,
    file_names: Vec<PathBuf>,
}

impl CacheDependency {
    pub fn new<K, F>(cache_keys: K, file_names: F) -> Self
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
        F: IntoIterator,
        F::Item: Into<PathBuf>,
    {
        let mut seen = HashSet::new();
        let cache_keys = cache_keys
            .into_iter()
            .map(|key| key.as_ref().to_lowercase())
            .filter(|key| !key.is_empty() && seen.insert(key.clone()))
            .collect();
        let file_names = file_names.into_iter().map(Into::into).collect();
        Self {
            cache_keys,
            file_names,
        }
    }

    pub fn from_keys<K>(cache_keys: K) -> Self
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
    {
        Self::new(cache_keys, Vec::<PathBuf>::new())
    }

    pub fn cache_keys(&self) -> &[String] {
        &self.cache_keys
    }

    pub fn file_names(&self) -> &[PathBuf] {
        &self.file_names
    }

    pub fn is_empty(&self) -> bool {
        self.cache_keys.is_empty() && self.file_names.is_empty()
    }
}

/// Ordered, de-duplicated accumulator of dependency keys.
#[derive(Debug, Clone, Default)]
pub struct DependencyList {
    keys: Vec<String>,
    seen: HashSet<String>,
}

impl DependencyList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key; returns false when it was already present.
    pub fn add(&mut self, key: impl AsRef<str>) -> bool {
        let key = key.as_ref().to_lowercase();
        if key.is_empty() || !self.seen.insert(key.clone()) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn extend<I>(&mut self, keys: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for key in keys {
            self.add(key);
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Freeze the accumulated keys into a dependency.
    pub fn to_dependency(&self) -> CacheDependency {
        CacheDependency::from_keys(&self.keys)
    }
}

/// Record a dependency key on the current task's list.
///
/// No-op when no list is active.
pub fn record(key: impl AsRef<str>) {
    let _ = DEPENDENCIES.try_with(|list| {
        list.borrow_mut().add(key);
    });
}

/// Snapshot of the current task's list, empty outside a scope.
pub fn current() -> DependencyList {
    DEPENDENCIES
        .try_with(|list| list.borrow().clone())
        .unwrap_or_default()
}

/// Run `future` with a fresh dependency list and return what it recorded.
pub async fn with_dependency_list<F, R>(future: F) -> (R, DependencyList)
where
    F: Future<Output = R>,
{
    DEPENDENCIES
        .scope(RefCell::new(DependencyList::new()), async move {
            let result = future.await;
            let recorded = DEPENDENCIES.with(|list| list.take());
            (result, recorded)
        })
        .await
}
