//! Web-farm synchronization.
//!
//! Every node runs the same cache. Local touch, remove and clear operations are
//! translated into [`WebFarmTask`]s and handed to a [`WebFarmTransport`], which
//! delivers them to the other nodes at least once. The receiving node replays
//! the same operation with propagation disabled.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::CacheError;

pub const METRIC_WEBFARM_TASK: &str = "farmcache_webfarm_task_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebFarmTaskType {
    TouchCacheItem,
    RemoveCacheItem,
    ClearCacheItems,
    ClearFullPageCache,
}

impl WebFarmTaskType {
    pub const ALL: [Self; 4] = [
        Self::TouchCacheItem,
        Self::RemoveCacheItem,
        Self::ClearCacheItems,
        Self::ClearFullPageCache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TouchCacheItem => "TouchCacheItem",
            Self::RemoveCacheItem => "RemoveCacheItem",
            Self::ClearCacheItems => "ClearCacheItems",
            Self::ClearFullPageCache => "ClearFullPageCache",
        }
    }
}

impl fmt::Display for WebFarmTaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebFarmTaskType {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task_type| task_type.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| CacheError::UnknownTask(value.to_string()))
    }
}

/// One replicated cache mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebFarmTask {
    pub id: Uuid,
    pub task_type: WebFarmTaskType,
    pub site_name: Option<String>,
    pub payload: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl WebFarmTask {
    pub fn new(task_type: WebFarmTaskType, site_name: Option<&str>, payload: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            site_name: site_name.map(str::to_string),
            payload,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Delivers tasks to the other nodes of the farm.
pub trait WebFarmTransport: Send + Sync {
    fn create_task(&self, task: WebFarmTask) -> Result<(), CacheError>;
}

/// Transport of a single-node deployment.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl WebFarmTransport for NullTransport {
    fn create_task(&self, _task: WebFarmTask) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Pushes tasks onto a channel for the embedding application to forward.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: Sender<WebFarmTask>,
}

impl ChannelTransport {
    pub fn new() -> (Self, Receiver<WebFarmTask>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl WebFarmTransport for ChannelTransport {
    fn create_task(&self, task: WebFarmTask) -> Result<(), CacheError> {
        self.sender
            .send(task)
            .map_err(|err| CacheError::transport(format!("task receiver dropped: {err}")))
    }
}

/// Translates local mutations into tasks while synchronization is enabled.
pub struct Synchronizer {
    enabled: AtomicBool,
    transport: Arc<dyn WebFarmTransport>,
}

impl Synchronizer {
    pub fn new(enabled: bool, transport: Arc<dyn WebFarmTransport>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            transport,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Hand a task to the transport; returns whether one was created.
    ///
    /// Transport failures are logged and never fail the local operation.
    pub fn propagate(
        &self,
        task_type: WebFarmTaskType,
        site_name: Option<&str>,
        payload: Vec<String>,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }

        let task = WebFarmTask::new(task_type, site_name, payload);
        let id = task.id;
        match self.transport.create_task(task) {
            Ok(()) => {
                counter!(METRIC_WEBFARM_TASK, "type" => task_type.as_str()).increment(1);
                debug!(
                    op = "webfarm::propagate",
                    task = %task_type,
                    task_id = %id,
                    "Web farm task created"
                );
                true
            }
            Err(err) => {
                warn!(
                    op = "webfarm::propagate",
                    result = "error",
                    task = %task_type,
                    task_id = %id,
                    error = %err,
                    "Failed to create web farm task"
                );
                false
            }
        }
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
