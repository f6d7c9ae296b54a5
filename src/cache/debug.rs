//! Debug/audit log of cache operations.
//!
//! Purely observational: sinks receive every add, get, remove and touch while
//! debugging is on, and nothing they do feeds back into the cache. Debugging
//! is on when the configuration says so or when the current task runs inside
//! [`with_debug_scope`].

use std::fmt;
use std::future::Future;

use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::value::Priority;

tokio::task_local! {
    static DEBUG_SCOPE: bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOperation {
    Add,
    Get,
    Remove,
    Touch,
}

impl fmt::Display for CacheOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Get => "get",
            Self::Remove => "remove",
            Self::Touch => "touch",
        })
    }
}

/// One logged cache operation.
#[derive(Debug, Clone)]
pub struct CacheLogEvent<'a> {
    pub operation: CacheOperation,
    pub key: &'a str,
    /// Kind of the value involved, `None` for a miss or a removal.
    pub value_kind: Option<&'static str>,
    pub dependencies: &'a [String],
    pub absolute_expiration: Option<OffsetDateTime>,
    pub sliding_expiration: Option<Duration>,
    pub priority: Option<Priority>,
}

impl<'a> CacheLogEvent<'a> {
    pub fn new(operation: CacheOperation, key: &'a str) -> Self {
        Self {
            operation,
            key,
            value_kind: None,
            dependencies: &[],
            absolute_expiration: None,
            sliding_expiration: None,
            priority: None,
        }
    }
}

/// Consumer of cache log events.
pub trait CacheDebugLog: Send + Sync {
    fn log(&self, event: &CacheLogEvent<'_>);
}

/// Emits each event as a `tracing` debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDebugLog;

impl CacheDebugLog for TracingDebugLog {
    fn log(&self, event: &CacheLogEvent<'_>) {
        debug!(
            target: "farmcache::debug",
            op = %event.operation,
            key = event.key,
            value_kind = event.value_kind.unwrap_or("none"),
            dependencies = ?event.dependencies,
            absolute_expiration = ?event.absolute_expiration,
            sliding_expiration = ?event.sliding_expiration,
            priority = ?event.priority,
            "Cache operation"
        );
    }
}

/// True when the current task asked for debug logging.
pub fn scope_enabled() -> bool {
    DEBUG_SCOPE.try_with(|enabled| *enabled).unwrap_or(false)
}

/// Run `future` with cache debug logging enabled for this task only.
pub async fn with_debug_scope<F, R>(future: F) -> R
where
    F: Future<Output = R>,
{
    DEBUG_SCOPE.scope(true, future).await
}
