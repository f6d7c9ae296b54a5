//! Values held by the cache and the metadata that travels with them.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shared, type-erased payload stored in the cache.
pub type SharedData = Arc<dyn Any + Send + Sync>;

/// Callback invoked when an entry leaves the store.
pub type RemovedCallback = Arc<dyn Fn(&str, &CacheValue, RemovalReason) + Send + Sync>;

/// Relative importance of an entry when the store has to shed load.
///
/// Ordered from most to least evictable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    /// Never evicted for capacity; only expiry, removal or a dependency drops it.
    NotRemovable,
}

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalReason {
    /// Explicit removal or replacement of the entry.
    Removed,
    /// Absolute or sliding expiration passed.
    Expired,
    /// Evicted to keep the store within capacity.
    Underused,
    /// A watched key or file changed.
    DependencyChanged,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Expired => "expired",
            Self::Underused => "underused",
            Self::DependencyChanged => "dependency_changed",
        }
    }
}

/// Capability for values that want to know when they are logically invalidated.
///
/// Only `Removed` and `DependencyChanged` reach the hook; expiry and capacity
/// eviction are not invalidations.
pub trait InvalidationAware: Send + Sync {
    fn invalidated(&self, key: &str, reason: RemovalReason);
}

/// Reference from the memory tier to an item that also lives on disk.
pub struct PersistentHandle {
    pub(crate) key: String,
    pub(crate) site_name: Option<String>,
    pub(crate) data: SharedData,
}

impl PersistentHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn site_name(&self) -> Option<&str> {
        self.site_name.as_deref()
    }
}

/// A cached value.
///
/// `Null` is the sentinel stored for a loader that produced nothing, so that
/// "cached as empty" and "not cached" stay distinguishable.
#[derive(Clone)]
pub enum CacheValue {
    Null,
    /// Anchor written by touch; carries no payload.
    Dummy,
    Object(SharedData),
    Invalidating {
        data: SharedData,
        hook: Arc<dyn InvalidationAware>,
    },
    Persistent(Arc<PersistentHandle>),
}

impl CacheValue {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Self::Object(Arc::new(value))
    }

    /// Wrap an optional value, substituting the null sentinel for `None`.
    pub fn from_option<T: Any + Send + Sync>(value: Option<T>) -> Self {
        value.map_or(Self::Null, Self::object)
    }

    /// Store a value whose hook fires when the entry is invalidated.
    pub fn with_invalidation<T>(value: Arc<T>) -> Self
    where
        T: InvalidationAware + Any,
    {
        let data: SharedData = value.clone();
        Self::Invalidating { data, hook: value }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Self::Dummy)
    }

    /// The payload, if this value carries one.
    pub fn data(&self) -> Option<&SharedData> {
        match self {
            Self::Object(data) | Self::Invalidating { data, .. } => Some(data),
            Self::Persistent(handle) => Some(&handle.data),
            Self::Null | Self::Dummy => None,
        }
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data()
            .and_then(|data| Arc::clone(data).downcast::<T>().ok())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Dummy => "dummy",
            Self::Object(_) => "object",
            Self::Invalidating { .. } => "invalidating",
            Self::Persistent(_) => "persistent",
        }
    }
}

impl fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistent(handle) => f
                .debug_struct("Persistent")
                .field("key", &handle.key)
                .field("site_name", &handle.site_name)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}
