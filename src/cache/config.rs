//! Runtime cache configuration.
//!
//! Built once from the loaded settings and handed to [`AppCache`] by value;
//! nothing in the cache reads configuration lazily after construction.
//!
//! [`AppCache`]: super::AppCache

use std::num::NonZeroUsize;
use std::path::PathBuf;

use time::Duration;

use crate::config::CacheSettings;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Initial state of the web-farm toggle.
    pub synchronize: bool,
    pub persistent_dir: PathBuf,
    pub key_context: Option<String>,
    pub capacity: NonZeroUsize,
    /// Default expiration of touch anchors.
    pub dummy_key_lifetime: Duration,
    /// Default extra lifetime of persistent files past their in-memory expiry.
    pub persistent_file_lifetime: Duration,
    pub debug: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::from(&CacheSettings::default())
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            synchronize: settings.synchronize,
            persistent_dir: settings.persistent_dir.clone(),
            key_context: settings.key_context.clone(),
            capacity: settings.capacity,
            dummy_key_lifetime: Duration::days(i64::from(settings.dummy_key_days.get())),
            persistent_file_lifetime: Duration::minutes(i64::from(
                settings.persistent_file_minutes.get(),
            )),
            debug: settings.debug,
        }
    }
}

impl CacheConfig {
    /// Defaults rooted at `persistent_dir`.
    pub fn with_persistent_dir(persistent_dir: impl Into<PathBuf>) -> Self {
        Self {
            persistent_dir: persistent_dir.into(),
            ..Self::default()
        }
    }
}
