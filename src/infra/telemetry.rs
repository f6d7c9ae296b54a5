use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every cache metric with the installed recorder.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            metric_names::REMOVED,
            Unit::Count,
            "Total number of entries removed explicitly or replaced."
        );
        describe_counter!(
            metric_names::EXPIRED,
            Unit::Count,
            "Total number of entries dropped after their expiration."
        );
        describe_counter!(
            metric_names::DEPENDENCY_CHANGED,
            Unit::Count,
            "Total number of entries dropped because a dependency changed."
        );
        describe_counter!(
            metric_names::UNDERUSED,
            Unit::Count,
            "Total number of entries evicted due to capacity."
        );
        describe_counter!(
            metric_names::PERSISTENT_READ,
            Unit::Count,
            "Total number of persistent cache file reads by result."
        );
        describe_counter!(
            metric_names::WEBFARM_TASK,
            Unit::Count,
            "Total number of web farm tasks created by type."
        );
    });
}
