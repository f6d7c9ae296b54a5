use thiserror::Error;

/// Errors surfaced by the cache core.
///
/// Environment failures in the persistent tier never show up here; they are
/// logged and treated as a miss. What remains are contract violations and
/// web-farm protocol mismatches.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    #[error("unknown web farm task type `{0}`")]
    UnknownTask(String),
    #[error("malformed `{task}` task: {reason}")]
    InvalidTask { task: &'static str, reason: String },
    #[error("web farm transport failed: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub fn invalid_task(task: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidTask {
            task,
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}
