use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;

use farmcache::cache::{AppCache, CacheConfig, PersistentOptions, SweepReport};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Report {
    title: String,
    rows: Vec<u32>,
}

fn sample() -> Report {
    Report {
        title: "quarterly".to_string(),
        rows: vec![1, 2, 3],
    }
}

fn cache_in(dir: &TempDir) -> AppCache {
    AppCache::new(CacheConfig::with_persistent_dir(dir.path()))
}

#[test]
fn add_then_restore_before_expiry() {
    let dir = TempDir::new().expect("temp dir");
    let cache = cache_in(&dir);
    let options = PersistentOptions {
        cache_minutes: 30,
        expires: Some(OffsetDateTime::now_utc() + Duration::minutes(30)),
        site_name: Some("corp".to_string()),
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("reports|q1", &sample(), &options).expect("write"));

    let restored: Arc<Report> = cache
        .try_restore_persistent("reports|q1", Some("corp"))
        .expect("restored");
    assert_eq!(*restored, sample());
    assert!(cache.contains("reports|q1", false));
}

#[test]
fn restore_after_file_expiry_deletes_the_file() {
    let dir = TempDir::new().expect("temp dir");
    let cache = cache_in(&dir);
    let now = OffsetDateTime::now_utc();
    let options = PersistentOptions {
        cache_minutes: 30,
        expires: Some(now - Duration::hours(2)),
        file_expires: Some(now - Duration::hours(1)),
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("reports|old", &sample(), &options).expect("write"));
    let path = cache.persistent().path_for("reports|old", None);
    assert!(path.exists());

    assert!(cache.try_restore_persistent::<Report>("reports|old", None).is_none());
    assert!(!path.exists());
}

#[test]
fn corrupt_file_is_a_miss_and_self_heals() {
    let dir = TempDir::new().expect("temp dir");
    let cache = cache_in(&dir);
    let path = cache.persistent().path_for("reports|broken", None);
    fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
    fs::write(&path, b"\x00\x01 not json").expect("write garbage");

    assert!(cache.try_restore_persistent::<Report>("reports|broken", None).is_none());
    assert!(!path.exists());
}

#[test]
fn wrong_payload_type_is_treated_as_corrupt() {
    let dir = TempDir::new().expect("temp dir");
    let cache = cache_in(&dir);
    let options = PersistentOptions {
        cache_minutes: 30,
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("reports|typed", &"text".to_string(), &options).expect("write"));

    assert!(cache.try_restore_persistent::<Report>("reports|typed", None).is_none());
    assert!(!cache.persistent().path_for("reports|typed", None).exists());
}

#[test]
fn concurrent_restores_share_one_disk_read() {
    const READERS: usize = 16;

    let dir = TempDir::new().expect("temp dir");
    let cache = Arc::new(cache_in(&dir));
    let options = PersistentOptions {
        cache_minutes: 30,
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("reports|hot", &sample(), &options).expect("write"));

    let barrier = Arc::new(Barrier::new(READERS));
    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .try_restore_persistent::<Report>("reports|hot", None)
                    .expect("restored")
            })
        })
        .collect();

    let results: Vec<Arc<Report>> = handles
        .into_iter()
        .map(|handle| handle.join().expect("reader completes"))
        .collect();

    assert_eq!(cache.persistent().disk_reads(), 1);
    assert!(results.iter().all(|report| Arc::ptr_eq(report, &results[0])));
    assert_eq!(*results[0], sample());
}

#[test]
fn sweep_keeps_live_files_only() {
    let dir = TempDir::new().expect("temp dir");
    let cache = cache_in(&dir);
    let now = OffsetDateTime::now_utc();

    let live = PersistentOptions {
        cache_minutes: 30,
        ..PersistentOptions::default()
    };
    let dead = PersistentOptions {
        cache_minutes: 30,
        expires: Some(now - Duration::hours(2)),
        file_expires: Some(now - Duration::hours(1)),
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("reports|live", &sample(), &live).expect("write"));
    assert!(cache.add_persistent("reports|dead", &sample(), &dead).expect("write"));

    let report = cache.persistent().sweep_expired(now);
    assert_eq!(
        report,
        SweepReport {
            scanned: 2,
            expired: 1,
            corrupt: 0,
        }
    );
    assert!(cache.persistent().path_for("reports|live", None).exists());
    assert!(!cache.persistent().path_for("reports|dead", None).exists());
}

#[test]
fn touching_a_dependency_removes_the_persistent_copy() {
    let dir = TempDir::new().expect("temp dir");
    let cache = cache_in(&dir);
    let options = PersistentOptions {
        cache_minutes: 30,
        dependency: cache.get_cache_dependency(["reports_list"], Vec::<std::path::PathBuf>::new()),
        ..PersistentOptions::default()
    };
    assert!(cache.add_persistent("reports|dep", &sample(), &options).expect("write"));
    assert!(cache.try_restore_persistent::<Report>("reports|dep", None).is_some());

    cache.touch("reports_list");

    assert!(!cache.contains("reports|dep", false));
    assert!(!cache.persistent().path_for("reports|dep", None).exists());
}
