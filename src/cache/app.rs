//! The application cache facade.
//!
//! [`AppCache`] ties the pieces together: keys are normalized by the
//! [`KeyBuilder`], entries go through the [`KeyValueStore`], touch manufactures
//! the watched keys the store's dependency mechanism reacts to, expensive items
//! overflow to the [`PersistentStore`], and every locally initiated mutation is
//! replicated through the [`Synchronizer`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info};

use super::config::CacheConfig;
use super::debug::{self, CacheDebugLog, CacheLogEvent, CacheOperation, TracingDebugLog};
use super::dependency::{CacheDependency, DependencyList};
use super::error::CacheError;
use super::keys::KeyBuilder;
use super::persistent::{PersistentCacheItem, PersistentStore, typed};
use super::stats::{CacheStatistics, StatisticsSnapshot};
use super::store::{EntryMetadata, KeyValueStore, MemoryStore, StoredEntry, expires_after};
use super::value::{
    CacheValue, PersistentHandle, Priority, RemovalReason, RemovedCallback, SharedData,
};
use super::webfarm::{NullTransport, Synchronizer, WebFarmTask, WebFarmTaskType, WebFarmTransport};

/// Options of [`AppCache::add`].
#[derive(Clone, Default)]
pub struct AddOptions {
    pub dependency: Option<CacheDependency>,
    pub absolute_expiration: Option<OffsetDateTime>,
    pub sliding_expiration: Option<Duration>,
    pub priority: Priority,
    /// Replaces the default removal callback when set.
    pub on_removed: Option<RemovedCallback>,
    pub case_sensitive: bool,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depends_on(mut self, dependency: CacheDependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn expires_at(mut self, expiration: OffsetDateTime) -> Self {
        self.absolute_expiration = Some(expiration);
        self
    }

    pub fn sliding(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_removed(mut self, callback: RemovedCallback) -> Self {
        self.on_removed = Some(callback);
        self
    }

    pub fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self
    }
}

/// Options of [`AppCache::add_persistent`].
#[derive(Debug, Clone, Default)]
pub struct PersistentOptions {
    pub dependency: CacheDependency,
    pub cache_minutes: u32,
    /// In-memory expiry; `None` means `cache_minutes` from restore time.
    pub expires: Option<OffsetDateTime>,
    /// Physical expiry of the file; defaults to the configured lifetime past `expires`.
    pub file_expires: Option<OffsetDateTime>,
    pub site_name: Option<String>,
}

/// Side effects of an entry leaving the memory tier.
struct RemovalHandler {
    statistics: Arc<CacheStatistics>,
    persistent: Arc<PersistentStore>,
    shutting_down: AtomicBool,
}

impl RemovalHandler {
    fn on_removed(&self, key: &str, value: &CacheValue, reason: RemovalReason) {
        if matches!(
            reason,
            RemovalReason::Removed | RemovalReason::DependencyChanged
        ) {
            match value {
                CacheValue::Persistent(handle) if !self.shutting_down.load(Ordering::Acquire) => {
                    self.persistent.delete(handle.key(), handle.site_name());
                }
                CacheValue::Invalidating { hook, .. } => hook.invalidated(key, reason),
                _ => {}
            }
        }
        self.statistics.record(reason);
    }
}

/// Builder for an [`AppCache`] with custom collaborators.
pub struct AppCacheBuilder {
    config: CacheConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    transport: Option<Arc<dyn WebFarmTransport>>,
    debug_log: Option<Arc<dyn CacheDebugLog>>,
}

impl AppCacheBuilder {
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn WebFarmTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn debug_log(mut self, debug_log: Arc<dyn CacheDebugLog>) -> Self {
        self.debug_log = Some(debug_log);
        self
    }

    pub fn build(self) -> AppCache {
        let Self {
            config,
            store,
            transport,
            debug_log,
        } = self;

        let store = store.unwrap_or_else(|| Arc::new(MemoryStore::new(config.capacity)));
        let transport = transport.unwrap_or_else(|| Arc::new(NullTransport));
        let debug_log = debug_log.unwrap_or_else(|| Arc::new(TracingDebugLog));
        let statistics = Arc::new(CacheStatistics::new());
        let persistent = Arc::new(PersistentStore::new(config.persistent_dir.clone()));
        let removal = Arc::new(RemovalHandler {
            statistics: Arc::clone(&statistics),
            persistent: Arc::clone(&persistent),
            shutting_down: AtomicBool::new(false),
        });

        info!(
            op = "cache::init",
            synchronize = config.synchronize,
            persistent_dir = %config.persistent_dir.display(),
            key_context = config.key_context.as_deref().unwrap_or(""),
            "Application cache initialised"
        );

        AppCache {
            keys: KeyBuilder::new(config.key_context.as_deref()),
            synchronizer: Synchronizer::new(config.synchronize, transport),
            config,
            store,
            persistent,
            debug_log,
            statistics,
            removal,
        }
    }
}

/// Application-wide cache shared by every request of the process.
pub struct AppCache {
    config: CacheConfig,
    keys: KeyBuilder,
    store: Arc<dyn KeyValueStore>,
    persistent: Arc<PersistentStore>,
    synchronizer: Synchronizer,
    debug_log: Arc<dyn CacheDebugLog>,
    statistics: Arc<CacheStatistics>,
    removal: Arc<RemovalHandler>,
}

impl AppCache {
    /// Cache over an in-memory store with no web-farm peers.
    pub fn new(config: CacheConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CacheConfig) -> AppCacheBuilder {
        AppCacheBuilder {
            config,
            store: None,
            transport: None,
            debug_log: None,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn key_builder(&self) -> &KeyBuilder {
        &self.keys
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn persistent(&self) -> &PersistentStore {
        &self.persistent
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }

    /// Stop deleting persistent files when entries leave memory.
    pub fn begin_shutdown(&self) {
        self.removal.shutting_down.store(true, Ordering::Release);
        info!(op = "cache::shutdown", "Persistent file cleanup disabled");
    }

    pub fn get(&self, key: &str, case_sensitive: bool) -> Option<CacheValue> {
        let full_key = self.keys.normalize(key, case_sensitive);
        let value = self.store.get(&full_key);
        if self.debug_enabled() {
            let mut event = CacheLogEvent::new(CacheOperation::Get, &full_key);
            event.value_kind = value.as_ref().map(CacheValue::kind);
            self.debug_log.log(&event);
        }
        value
    }

    pub fn contains(&self, key: &str, case_sensitive: bool) -> bool {
        self.store
            .contains(&self.keys.normalize(key, case_sensitive))
    }

    pub(super) fn contains_full_key(&self, full_key: &str) -> bool {
        self.store.contains(full_key)
    }

    /// Expiry and priority of the entry at `key`.
    pub fn metadata(&self, key: &str, case_sensitive: bool) -> Option<EntryMetadata> {
        self.store
            .metadata(&self.keys.normalize(key, case_sensitive))
    }

    /// Insert `value` under `key`.
    ///
    /// Dependency keys are ensured first so the new entry always has something
    /// to watch.
    pub fn add(&self, key: &str, value: CacheValue, options: AddOptions) -> Result<(), CacheError> {
        if key.is_empty() {
            return Err(CacheError::invalid_argument("key", "must not be empty"));
        }
        if options.absolute_expiration.is_some() && options.sliding_expiration.is_some() {
            return Err(CacheError::invalid_argument(
                "expiration",
                "absolute and sliding expiration are mutually exclusive",
            ));
        }

        let full_key = self.keys.normalize(key, options.case_sensitive);
        self.insert_entry(full_key, value, options);
        Ok(())
    }

    pub(super) fn insert_entry(&self, full_key: String, value: CacheValue, options: AddOptions) {
        let AddOptions {
            dependency,
            absolute_expiration,
            sliding_expiration,
            priority,
            on_removed,
            ..
        } = options;

        let dependency = dependency.unwrap_or_default();
        for dependency_key in dependency.cache_keys() {
            self.ensure_key(dependency_key, None);
        }
        let dependency_keys: Vec<String> = dependency
            .cache_keys()
            .iter()
            .map(|dependency_key| self.keys.full_key(dependency_key))
            .collect();

        if self.debug_enabled() {
            let mut event = CacheLogEvent::new(CacheOperation::Add, &full_key);
            event.value_kind = Some(value.kind());
            event.dependencies = &dependency_keys;
            event.absolute_expiration = absolute_expiration;
            event.sliding_expiration = sliding_expiration;
            event.priority = Some(priority);
            self.debug_log.log(&event);
        }

        let entry = StoredEntry {
            value,
            dependency_files: dependency.file_names().to_vec(),
            dependency_keys,
            absolute_expiration,
            sliding_expiration,
            priority,
            on_removed: Some(on_removed.unwrap_or_else(|| self.default_callback())),
        };
        self.store.insert(full_key, entry);
    }

    fn default_callback(&self) -> RemovedCallback {
        let removal = Arc::clone(&self.removal);
        Arc::new(
            move |key: &str, value: &CacheValue, reason: RemovalReason| {
                removal.on_removed(key, value, reason)
            },
        )
    }

    /// Remove `key` here and on every other node.
    pub fn remove(&self, key: &str, case_sensitive: bool) -> bool {
        let removed = self.remove_local(key, case_sensitive);
        self.synchronizer.propagate(
            WebFarmTaskType::RemoveCacheItem,
            None,
            vec![key.to_string(), case_sensitive.to_string()],
        );
        removed
    }

    fn remove_local(&self, key: &str, case_sensitive: bool) -> bool {
        let full_key = self.keys.normalize(key, case_sensitive);
        if self.debug_enabled() {
            self.debug_log
                .log(&CacheLogEvent::new(CacheOperation::Remove, &full_key));
        }
        self.store.remove(&full_key)
    }

    /// Touch `key`, creating the anchor if it does not exist yet.
    pub fn touch(&self, key: &str) {
        self.touch_with(key, true, None);
    }

    /// Rewrite the anchor at `key` so everything depending on it is dropped.
    ///
    /// Without `ensure_key` an absent key stays absent locally. The touch is
    /// replicated either way.
    pub fn touch_with(&self, key: &str, ensure_key: bool, expiration: Option<OffsetDateTime>) {
        self.touch_local(key, ensure_key, expiration);
        self.synchronizer.propagate(
            WebFarmTaskType::TouchCacheItem,
            None,
            vec![key.to_string()],
        );
    }

    /// Touch each key; one task carries the whole batch to the other nodes.
    pub fn touch_keys<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| key.as_ref().to_string())
            .filter(|key| !key.is_empty())
            .collect();
        if keys.is_empty() {
            return;
        }
        for key in &keys {
            self.touch_local(key, true, None);
        }
        self.synchronizer
            .propagate(WebFarmTaskType::TouchCacheItem, None, keys);
    }

    /// Create the anchor at `key` unless it already exists.
    ///
    /// An existing anchor keeps its expiration. Not replicated: every node
    /// ensures its own anchors before attaching dependencies to them.
    pub fn ensure_key(&self, key: &str, expiration: Option<OffsetDateTime>) {
        let full_key = self.keys.normalize(key, false);
        if !self.store.contains(&full_key) {
            self.write_anchor(full_key, expiration);
        }
    }

    fn touch_local(&self, key: &str, ensure_key: bool, expiration: Option<OffsetDateTime>) {
        if key.is_empty() {
            return;
        }
        let full_key = self.keys.normalize(key, false);
        if ensure_key || self.store.contains(&full_key) {
            self.write_anchor(full_key, expiration);
        }
    }

    fn write_anchor(&self, full_key: String, expiration: Option<OffsetDateTime>) {
        let expiration = expiration.unwrap_or_else(|| {
            expires_after(OffsetDateTime::now_utc(), self.config.dummy_key_lifetime)
        });

        if self.debug_enabled() {
            let mut event = CacheLogEvent::new(CacheOperation::Touch, &full_key);
            event.value_kind = Some(CacheValue::Dummy.kind());
            event.absolute_expiration = Some(expiration);
            event.priority = Some(Priority::NotRemovable);
            self.debug_log.log(&event);
        }

        let entry = StoredEntry {
            absolute_expiration: Some(expiration),
            priority: Priority::NotRemovable,
            on_removed: Some(self.default_callback()),
            ..StoredEntry::new(CacheValue::Dummy)
        };
        self.store.insert(full_key, entry);
    }

    /// Remove every entry whose key starts with `prefix`; returns how many went.
    pub fn clear_cache(&self, prefix: &str) -> usize {
        let cleared = self.clear_local(prefix);
        self.synchronizer.propagate(
            WebFarmTaskType::ClearCacheItems,
            None,
            vec![prefix.to_string()],
        );
        cleared
    }

    /// Drop the full-page cache of `site_name`, or of every site.
    pub fn clear_full_page_cache(&self, site_name: Option<&str>) -> usize {
        let cleared = self.clear_local(&KeyBuilder::full_page_prefix(site_name));
        self.synchronizer.propagate(
            WebFarmTaskType::ClearFullPageCache,
            site_name,
            site_name.map(str::to_string).into_iter().collect(),
        );
        cleared
    }

    fn clear_local(&self, prefix: &str) -> usize {
        let full_prefix = self.keys.full_key(prefix).to_lowercase();
        let matched: Vec<String> = self
            .store
            .keys()
            .into_iter()
            .filter(|key| key.to_lowercase().starts_with(&full_prefix))
            .collect();

        let mut cleared = 0;
        for key in &matched {
            if self.store.remove(key) {
                cleared += 1;
            }
        }
        debug!(
            op = "cache::clear",
            prefix = %full_prefix,
            matched = matched.len(),
            cleared,
            "Cache entries cleared by prefix"
        );
        cleared
    }

    /// Ensure every key, then freeze keys and files into a dependency.
    pub fn get_cache_dependency<K, F>(&self, keys: K, files: F) -> CacheDependency
    where
        K: IntoIterator,
        K::Item: AsRef<str>,
        F: IntoIterator,
        F::Item: Into<std::path::PathBuf>,
    {
        let dependency = CacheDependency::new(keys, files);
        for key in dependency.cache_keys() {
            self.ensure_key(key, None);
        }
        dependency
    }

    /// Flush a request-scoped list into a dependency.
    pub fn dependency_from_list(&self, list: &DependencyList) -> CacheDependency {
        self.get_cache_dependency(list.keys(), Vec::<std::path::PathBuf>::new())
    }

    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// Write `data` to the persistent tier. Returns false when the write failed.
    pub fn add_persistent<T: Serialize>(
        &self,
        key: &str,
        data: &T,
        options: &PersistentOptions,
    ) -> Result<bool, CacheError> {
        if key.is_empty() {
            return Err(CacheError::invalid_argument("key", "must not be empty"));
        }
        Ok(self.write_persistent(self.keys.normalize(key, false), data, options))
    }

    pub(crate) fn write_persistent<T: Serialize>(
        &self,
        full_key: String,
        data: &T,
        options: &PersistentOptions,
    ) -> bool {
        let now = OffsetDateTime::now_utc();
        let effective_expires = options.expires.unwrap_or_else(|| {
            expires_after(now, Duration::minutes(i64::from(options.cache_minutes)))
        });
        let file_expires = options
            .file_expires
            .unwrap_or_else(|| {
                expires_after(effective_expires, self.config.persistent_file_lifetime)
            })
            .max(effective_expires);

        let item = PersistentCacheItem {
            cache_key: full_key,
            site_name: options.site_name.clone(),
            data,
            dependencies: options.dependency.clone(),
            cache_minutes: options.cache_minutes,
            expires: options.expires,
            file_expires,
        };
        self.persistent.write(&item)
    }

    /// Restore `key` from disk into memory.
    ///
    /// Concurrent calls for the same key share one disk read and observe the
    /// same value.
    pub fn try_restore_persistent<T>(&self, key: &str, site_name: Option<&str>) -> Option<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.restore_persistent(self.keys.normalize(key, false), site_name)
    }

    pub(crate) fn restore_persistent<T>(
        &self,
        full_key: String,
        site_name: Option<&str>,
    ) -> Option<Arc<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let result = self.persistent.single_flight(&full_key, || {
            if let Some(data) = self.store.get(&full_key).as_ref().and_then(CacheValue::data) {
                return Some(Arc::clone(data));
            }

            let now = OffsetDateTime::now_utc();
            let item: PersistentCacheItem<T> = self.persistent.read(&full_key, site_name, now)?;
            let expires = item
                .expires
                .unwrap_or_else(|| {
                    expires_after(now, Duration::minutes(i64::from(item.cache_minutes)))
                })
                .min(item.file_expires);
            if expires <= now {
                return None;
            }

            let data: SharedData = Arc::new(item.data);
            let handle = PersistentHandle {
                key: full_key.clone(),
                site_name: item.site_name,
                data: Arc::clone(&data),
            };
            self.insert_entry(
                full_key.clone(),
                CacheValue::Persistent(Arc::new(handle)),
                AddOptions::new()
                    .depends_on(item.dependencies)
                    .expires_at(expires),
            );
            debug!(
                op = "persistent::restore",
                key = %full_key,
                "Persistent cache item promoted to memory"
            );
            Some(data)
        });
        typed(result)
    }

    pub fn delete_persistent(&self, key: &str, site_name: Option<&str>) {
        self.persistent
            .delete(&self.keys.normalize(key, false), site_name);
    }

    /// Replay a task received from another node without re-broadcasting it.
    pub fn process_task(&self, task: &WebFarmTask) -> Result<(), CacheError> {
        let task_name = task.task_type.as_str();
        debug!(
            op = "webfarm::process",
            task = task_name,
            task_id = %task.id,
            "Replaying web farm task"
        );

        match task.task_type {
            WebFarmTaskType::TouchCacheItem => {
                if task.payload.is_empty() {
                    return Err(CacheError::invalid_task(task_name, "missing keys"));
                }
                for key in &task.payload {
                    self.touch_local(key, false, None);
                }
            }
            WebFarmTaskType::RemoveCacheItem => {
                let key = task
                    .payload
                    .first()
                    .ok_or_else(|| CacheError::invalid_task(task_name, "missing key"))?;
                let case_sensitive = match task.payload.get(1) {
                    Some(flag) => flag.parse::<bool>().map_err(|_| {
                        CacheError::invalid_task(task_name, format!("invalid flag `{flag}`"))
                    })?,
                    None => false,
                };
                self.remove_local(key, case_sensitive);
            }
            WebFarmTaskType::ClearCacheItems => {
                let prefix = task
                    .payload
                    .first()
                    .ok_or_else(|| CacheError::invalid_task(task_name, "missing prefix"))?;
                self.clear_local(prefix);
            }
            WebFarmTaskType::ClearFullPageCache => {
                let site_name = task
                    .site_name
                    .as_deref()
                    .or_else(|| task.payload.first().map(String::as_str));
                self.clear_local(&KeyBuilder::full_page_prefix(site_name));
            }
        }
        Ok(())
    }

    /// Replay a task identified by its wire name.
    pub fn process_task_named(
        &self,
        task_name: &str,
        site_name: Option<&str>,
        payload: Vec<String>,
    ) -> Result<(), CacheError> {
        let task_type = task_name.parse::<WebFarmTaskType>().inspect_err(|err| {
            error!(
                op = "webfarm::process",
                result = "rejected",
                task = task_name,
                error = %err,
                "Rejected web farm task"
            );
        })?;
        self.process_task(&WebFarmTask::new(task_type, site_name, payload))
    }

    fn debug_enabled(&self) -> bool {
        self.config.debug || debug::scope_enabled()
    }
}
