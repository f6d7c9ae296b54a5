//! Read-through entry points.
//!
//! `cache` looks the key up, runs the loader on a miss and stores what it
//! produced. `cache_persistent` adds the disk tier between memory and the
//! loader.

use std::any::Any;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::{Duration, OffsetDateTime};
use tracing::warn;

use super::app::{AddOptions, AppCache, PersistentOptions};
use super::dependency::CacheDependency;
use super::error::CacheError;
use super::keys::KeyBuilder;
use super::store::expires_after;
use super::value::{CacheValue, PersistentHandle, Priority, SharedData};

/// How one loaded item is cached.
///
/// The loader receives these settings mutably: it may attach the dependency it
/// discovered while loading, or set `cache_minutes` to zero to keep this
/// result out of the cache.
#[derive(Debug, Clone)]
pub struct CacheItemSettings {
    pub key: String,
    pub cache_minutes: u32,
    pub case_sensitive: bool,
    pub priority: Priority,
    /// Expire `cache_minutes` after the last access instead of after insertion.
    pub sliding: bool,
    pub dependency: Option<CacheDependency>,
    pub site_name: Option<String>,
    /// Lifetime of the persistent file past the in-memory expiry.
    pub persistent_file_minutes: Option<u32>,
}

impl CacheItemSettings {
    pub fn new(key: impl Into<String>, cache_minutes: u32) -> Self {
        Self {
            key: key.into(),
            cache_minutes,
            case_sensitive: false,
            priority: Priority::Normal,
            sliding: false,
            dependency: None,
            site_name: None,
            persistent_file_minutes: None,
        }
    }

    /// Settings keyed by the lowercased join of `parts`.
    pub fn from_parts<I, S>(parts: I, cache_minutes: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(KeyBuilder::build_key(parts, true), cache_minutes)
    }

    pub fn depends_on(mut self, dependency: CacheDependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn site(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = Some(site_name.into());
        self
    }

    pub fn is_cacheable(&self) -> bool {
        self.cache_minutes > 0
    }

    fn add_options(&self, now: OffsetDateTime) -> AddOptions {
        let window = Duration::minutes(i64::from(self.cache_minutes));
        let options = AddOptions::new()
            .priority(self.priority)
            .case_sensitive(self.case_sensitive);
        let options = match &self.dependency {
            Some(dependency) => options.depends_on(dependency.clone()),
            None => options,
        };
        if self.sliding {
            options.sliding(window)
        } else {
            options.expires_at(expires_after(now, window))
        }
    }
}

enum Lookup<T> {
    Hit(Option<Arc<T>>),
    Miss,
}

impl AppCache {
    /// Return the cached value for `settings.key`, loading it on a miss.
    ///
    /// A loader error is returned as is and nothing is cached. A loader that
    /// returns `None` caches the null sentinel, so the next call is a hit.
    pub fn cache<T, E, F>(&self, mut settings: CacheItemSettings, loader: F) -> Result<Option<Arc<T>>, E>
    where
        T: Any + Send + Sync,
        E: From<CacheError>,
        F: FnOnce(&mut CacheItemSettings) -> Result<Option<T>, E>,
    {
        validate(&settings)?;
        if !settings.is_cacheable() {
            return Ok(loader(&mut settings)?.map(Arc::new));
        }

        if let Lookup::Hit(value) = self.lookup::<T>(&settings) {
            return Ok(value);
        }

        let loaded = loader(&mut settings)?.map(Arc::new);
        if settings.is_cacheable() {
            let value = match &loaded {
                Some(data) => CacheValue::Object(Arc::clone(data) as SharedData),
                None => CacheValue::Null,
            };
            self.store_loaded(&settings, value);
        }
        Ok(loaded)
    }

    /// Like [`AppCache::cache`], with the persistent tier consulted after a
    /// memory miss and written after a load.
    ///
    /// Null results are cached in memory only.
    pub fn cache_persistent<T, E, F>(
        &self,
        mut settings: CacheItemSettings,
        loader: F,
    ) -> Result<Option<Arc<T>>, E>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        E: From<CacheError>,
        F: FnOnce(&mut CacheItemSettings) -> Result<Option<T>, E>,
    {
        validate(&settings)?;
        if !settings.is_cacheable() {
            return Ok(loader(&mut settings)?.map(Arc::new));
        }

        if let Lookup::Hit(value) = self.lookup::<T>(&settings) {
            return Ok(value);
        }

        let full_key = self
            .key_builder()
            .normalize(&settings.key, settings.case_sensitive);
        if let Some(restored) =
            self.restore_persistent::<T>(full_key.clone(), settings.site_name.as_deref())
        {
            return Ok(Some(restored));
        }

        let loaded = loader(&mut settings)?.map(Arc::new);
        if !settings.is_cacheable() {
            return Ok(loaded);
        }

        let Some(data) = &loaded else {
            self.store_loaded(&settings, CacheValue::Null);
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        let handle = PersistentHandle {
            key: full_key.clone(),
            site_name: settings.site_name.clone(),
            data: Arc::clone(data) as SharedData,
        };
        self.insert_entry(
            full_key.clone(),
            CacheValue::Persistent(Arc::new(handle)),
            settings.add_options(now),
        );

        let window = expires_after(now, Duration::minutes(i64::from(settings.cache_minutes)));
        let expires = (!settings.sliding).then_some(window);
        let file_expires = settings
            .persistent_file_minutes
            .map(|minutes| expires_after(window, Duration::minutes(i64::from(minutes))));
        let options = PersistentOptions {
            dependency: settings.dependency.clone().unwrap_or_default(),
            cache_minutes: settings.cache_minutes,
            expires,
            file_expires,
            site_name: settings.site_name.clone(),
        };
        self.write_persistent(full_key.clone(), &**data, &options);
        if !self.contains_full_key(&full_key) {
            // Dropped while the file was being written; the file is stale.
            self.persistent()
                .delete(&full_key, settings.site_name.as_deref());
        }

        Ok(loaded)
    }

    fn lookup<T: Any + Send + Sync>(&self, settings: &CacheItemSettings) -> Lookup<T> {
        match self.get(&settings.key, settings.case_sensitive) {
            None | Some(CacheValue::Dummy) => Lookup::Miss,
            Some(CacheValue::Null) => Lookup::Hit(None),
            Some(value) => match value.downcast::<T>() {
                Some(data) => Lookup::Hit(Some(data)),
                None => {
                    warn!(
                        op = "cache::lookup",
                        result = "type_mismatch",
                        key = %settings.key,
                        kind = value.kind(),
                        "Cached value has an unexpected type; reloading"
                    );
                    Lookup::Miss
                }
            },
        }
    }

    fn store_loaded(&self, settings: &CacheItemSettings, value: CacheValue) {
        let full_key = self
            .key_builder()
            .normalize(&settings.key, settings.case_sensitive);
        self.insert_entry(full_key, value, settings.add_options(OffsetDateTime::now_utc()));
    }
}

fn validate(settings: &CacheItemSettings) -> Result<(), CacheError> {
    if settings.key.is_empty() {
        return Err(CacheError::invalid_argument("key", "must not be empty"));
    }
    Ok(())
}
