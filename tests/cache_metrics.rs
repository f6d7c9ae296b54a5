use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use farmcache::cache::{
    AddOptions, AppCache, CacheConfig, CacheDependency, CacheValue, ChannelTransport,
    PersistentOptions, metric_names,
};
use farmcache::infra::telemetry;
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serial_test::serial;
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        telemetry::describe_metrics();
        snapshotter
    })
}

fn recorded() -> HashSet<(String, Vec<(String, String)>)> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| {
            let key = composite_key.key();
            let labels = key
                .labels()
                .map(|label| (label.key().to_string(), label.value().to_string()))
                .collect();
            (key.name().to_string(), labels)
        })
        .collect()
}

#[test]
#[serial]
fn removal_reasons_emit_counters() {
    snapshotter();
    let dir = TempDir::new().expect("temp dir");
    let config = CacheConfig {
        capacity: NonZeroUsize::new(2).expect("non-zero"),
        ..CacheConfig::with_persistent_dir(dir.path())
    };
    let cache = AppCache::new(config);

    cache
        .add(
            "news|1",
            CacheValue::object(1_u8),
            AddOptions::new().depends_on(CacheDependency::from_keys(["news_list"])),
        )
        .expect("add dependent");
    cache.touch("news_list");

    cache
        .add(
            "short",
            CacheValue::object(1_u8),
            AddOptions::new().expires_at(OffsetDateTime::now_utc() - Duration::seconds(1)),
        )
        .expect("add expired");
    cache.purge_expired();

    for key in ["a", "b", "c"] {
        cache
            .add(key, CacheValue::object(1_u8), AddOptions::new())
            .expect("add");
    }

    let names: HashSet<String> = recorded().into_iter().map(|(name, _)| name).collect();
    for metric in [
        metric_names::REMOVED,
        metric_names::EXPIRED,
        metric_names::DEPENDENCY_CHANGED,
        metric_names::UNDERUSED,
    ] {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}

#[test]
#[serial]
fn persistent_reads_and_tasks_are_labelled() {
    snapshotter();
    let dir = TempDir::new().expect("temp dir");
    let (transport, _outbox) = ChannelTransport::new();
    let config = CacheConfig {
        synchronize: true,
        ..CacheConfig::with_persistent_dir(dir.path())
    };
    let cache = AppCache::builder(config)
        .transport(Arc::new(transport))
        .build();

    let options = PersistentOptions {
        cache_minutes: 5,
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("metrics|hit", &1_u32, &options).expect("write"));
    assert!(cache.try_restore_persistent::<u32>("metrics|hit", None).is_some());
    assert!(cache.try_restore_persistent::<u32>("metrics|missing", None).is_none());
    cache.touch("metrics_anchor");

    let recorded = recorded();
    let expected = [
        (metric_names::PERSISTENT_READ, ("result", "hit")),
        (metric_names::PERSISTENT_READ, ("result", "missing")),
        (metric_names::WEBFARM_TASK, ("type", "TouchCacheItem")),
    ];
    for (name, (label, value)) in expected {
        let present = recorded.iter().any(|(recorded_name, labels)| {
            recorded_name == name
                && labels
                    .iter()
                    .any(|(key, recorded_value)| key == label && recorded_value == value)
        });
        assert!(present, "missing metric: {name}{{{label}={value}}}");
    }
}
