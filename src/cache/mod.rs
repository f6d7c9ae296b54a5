//! Application cache for a web farm.
//!
//! Every node of the farm runs the same cache:
//!
//! - **Memory tier**: entries live in a [`KeyValueStore`] that drops an entry
//!   when a key it depends on is replaced or removed.
//! - **Touch invalidation**: [`AppCache::touch`] rewrites an anchor key so that
//!   every entry depending on it disappears.
//! - **Persistent tier**: expensive items are also written to disk and
//!   restored after a restart through a single-flight read.
//! - **Web farm**: local touch, remove and clear operations are replicated to
//!   the other nodes as [`WebFarmTask`]s.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! synchronize = true
//! persistent_dir = "/var/lib/app/persistent-cache"
//! key_context = "tenant-a"
//! capacity = 10000
//! ```

mod app;
mod config;
pub mod debug;
pub mod dependency;
mod error;
mod graph;
mod keys;
mod loader;
mod lock;
mod persistent;
mod stats;
mod store;
mod value;
mod webfarm;

pub use app::{AddOptions, AppCache, AppCacheBuilder, PersistentOptions};
pub use config::CacheConfig;
pub use debug::{CacheDebugLog, CacheLogEvent, CacheOperation, TracingDebugLog};
pub use dependency::{CacheDependency, DependencyList};
pub use error::CacheError;
pub use keys::{FULL_PAGE_NAMESPACE, KEY_SEPARATOR, KeyBuilder, first_segment};
pub use loader::CacheItemSettings;
pub use persistent::{PersistentCacheItem, PersistentHeader, PersistentStore, SweepReport};
pub use stats::{CacheStatistics, StatisticsSnapshot};
pub use store::{EntryMetadata, KeyValueStore, MemoryStore, StoredEntry};
pub use value::{
    CacheValue, InvalidationAware, PersistentHandle, Priority, RemovalReason, RemovedCallback,
    SharedData,
};
pub use webfarm::{
    ChannelTransport, NullTransport, Synchronizer, WebFarmTask, WebFarmTaskType, WebFarmTransport,
};

/// Names of every metric the cache publishes.
pub mod metric_names {
    pub use super::persistent::METRIC_PERSISTENT_READ as PERSISTENT_READ;
    pub use super::stats::{
        METRIC_DEPENDENCY_CHANGED as DEPENDENCY_CHANGED, METRIC_EXPIRED as EXPIRED,
        METRIC_REMOVED as REMOVED, METRIC_UNDERUSED as UNDERUSED,
    };
    pub use super::webfarm::METRIC_WEBFARM_TASK as WEBFARM_TASK;
}
