//! Disk-backed overflow tier.
//!
//! Items expensive enough to outlive a restart are also serialized to disk at
//! a path derived from `(site, key)`. There is no index: the presence of the
//! file is the index. Every write and delete in the process serializes on one
//! lock. Reads are not under that lock; they go through a per-key single
//! flight so concurrent restores of the same key share one disk read.
//!
//! I/O failures never escape this module. A missing, unreadable or corrupt
//! file is a miss, and the latter two are deleted on the way out.

use std::any::Any;
use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use dashmap::DashMap;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::dependency::CacheDependency;
use super::error::CacheError;
use super::keys::first_segment;
use super::lock::mutex_lock;
use super::value::SharedData;

const SOURCE: &str = "cache::persistent";
const GLOBAL_SITE_DIR: &str = "_Global";
const FILE_EXTENSION: &str = "cache";
const SEGMENT_MAX_LEN: usize = 64;
const FLIGHT_PREFIX: &str = "restorepersistent|";
pub const METRIC_PERSISTENT_READ: &str = "farmcache_persistent_read_total";

/// An item as stored on disk.
///
/// `expires` governs promotion back into memory, `file_expires` governs
/// physical deletion and is never earlier than `expires`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentCacheItem<T> {
    pub cache_key: String,
    pub site_name: Option<String>,
    pub data: T,
    #[serde(default)]
    pub dependencies: CacheDependency,
    pub cache_minutes: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub file_expires: OffsetDateTime,
}

/// Every field of a persistent item except its payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PersistentHeader {
    pub cache_key: String,
    pub site_name: Option<String>,
    #[serde(default)]
    pub dependencies: CacheDependency,
    pub cache_minutes: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub file_expires: OffsetDateTime,
}

/// Outcome of [`PersistentStore::sweep_expired`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub corrupt: usize,
}

type FlightResult = Option<SharedData>;

/// Owner of the persistent directory.
pub struct PersistentStore {
    root: PathBuf,
    write_lock: Mutex<()>,
    flights: DashMap<String, Arc<OnceLock<FlightResult>>>,
    disk_reads: AtomicU64,
}

impl PersistentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
            flights: DashMap::new(),
            disk_reads: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of file reads performed so far.
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    /// `{root}/{site or _Global}/{first key segment}/{bucket}/{len}_{hash}.cache`
    pub fn path_for(&self, key: &str, site_name: Option<&str>) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_bytes()));
        let site = site_name
            .filter(|site| !site.trim().is_empty())
            .map(sanitize_segment)
            .unwrap_or_else(|| GLOBAL_SITE_DIR.to_string());

        self.root
            .join(site)
            .join(sanitize_segment(first_segment(key)))
            .join(&hash[..2])
            .join(format!("{}_{hash}.{FILE_EXTENSION}", key.len()))
    }

    /// Serialize `item` to its path. Returns false when the write failed.
    pub fn write<T: Serialize>(&self, item: &PersistentCacheItem<T>) -> bool {
        let path = self.path_for(&item.cache_key, item.site_name.as_deref());
        let _guard = mutex_lock(&self.write_lock, SOURCE, "write");

        match write_atomically(&path, item) {
            Ok(()) => {
                debug!(
                    op = "persistent::write",
                    key = %item.cache_key,
                    path = %path.display(),
                    "Persistent cache item written"
                );
                true
            }
            Err(err) => {
                warn!(
                    op = "persistent::write",
                    result = "error",
                    key = %item.cache_key,
                    path = %path.display(),
                    error = %err,
                    "Failed to write persistent cache item"
                );
                false
            }
        }
    }

    /// Read the item for `key`, deleting the file when it is expired or corrupt.
    pub fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        site_name: Option<&str>,
        now: OffsetDateTime,
    ) -> Option<PersistentCacheItem<T>> {
        let path = self.path_for(key, site_name);
        self.disk_reads.fetch_add(1, Ordering::Relaxed);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                record_read("missing");
                return None;
            }
            Err(err) => {
                warn!(
                    op = "persistent::read",
                    result = "unreadable",
                    path = %path.display(),
                    error = %err,
                    "Failed to read persistent cache item; discarding"
                );
                record_read("unreadable");
                self.delete_path(&path);
                return None;
            }
        };

        match serde_json::from_slice::<PersistentCacheItem<T>>(&bytes) {
            Ok(item) if item.file_expires <= now => {
                record_read("expired");
                self.delete_path(&path);
                None
            }
            Ok(item) => {
                record_read("hit");
                Some(item)
            }
            Err(err) => {
                warn!(
                    op = "persistent::read",
                    result = "corrupt",
                    path = %path.display(),
                    error = %err,
                    "Corrupt persistent cache item; discarding"
                );
                record_read("corrupt");
                self.delete_path(&path);
                None
            }
        }
    }

    /// Best-effort removal of the file backing `key`.
    pub fn delete(&self, key: &str, site_name: Option<&str>) {
        let path = self.path_for(key, site_name);
        self.delete_path(&path);
    }

    fn delete_path(&self, path: &Path) {
        let _guard = mutex_lock(&self.write_lock, SOURCE, "delete");
        match fs::remove_file(path) {
            Ok(()) => debug!(
                op = "persistent::delete",
                path = %path.display(),
                "Persistent cache item deleted"
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                op = "persistent::delete",
                result = "error",
                path = %path.display(),
                error = %err,
                "Failed to delete persistent cache item"
            ),
        }
    }

    /// Run `restore` at most once at a time per key.
    ///
    /// The first caller for a key runs `restore`; callers arriving while it
    /// runs block and receive the same result. The flight is forgotten once
    /// it completes, so later callers start a new one.
    pub(crate) fn single_flight<F>(&self, key: &str, restore: F) -> FlightResult
    where
        F: FnOnce() -> FlightResult,
    {
        let flight_key = format!("{FLIGHT_PREFIX}{key}");
        let flight: Arc<OnceLock<FlightResult>> = self
            .flights
            .entry(flight_key.clone())
            .or_insert_with(|| Arc::new(OnceLock::new()))
            .clone();

        let result = flight.get_or_init(restore).clone();
        self.flights
            .remove_if(&flight_key, |_, current| Arc::ptr_eq(current, &flight));
        result
    }

    /// Header of the item for `key`, without promoting or deleting anything.
    pub fn inspect(
        &self,
        key: &str,
        site_name: Option<&str>,
    ) -> Result<Option<PersistentHeader>, CacheError> {
        let path = self.path_for(key, site_name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every file whose `file_expires` passed or that fails to parse.
    pub fn sweep_expired(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.root.is_dir() {
            return report;
        }

        let files = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|extension| extension == FILE_EXTENSION)
            });

        for entry in files {
            report.scanned += 1;
            let header = fs::read(entry.path())
                .ok()
                .and_then(|bytes| serde_json::from_slice::<PersistentHeader>(&bytes).ok());
            match header {
                Some(header) if header.file_expires > now => {}
                Some(_) => {
                    report.expired += 1;
                    self.delete_path(entry.path());
                }
                None => {
                    report.corrupt += 1;
                    self.delete_path(entry.path());
                }
            }
        }

        info!(
            op = "persistent::sweep",
            root = %self.root.display(),
            scanned = report.scanned,
            expired = report.expired,
            corrupt = report.corrupt,
            "Persistent cache sweep complete"
        );
        report
    }
}

fn write_atomically<T: Serialize>(
    path: &Path,
    item: &PersistentCacheItem<T>,
) -> Result<(), CacheError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file = tempfile::Builder::new()
        .suffix(".tmp")
        .tempfile_in(parent)?;
    {
        let mut writer = BufWriter::new(file.as_file());
        serde_json::to_writer(&mut writer, item)?;
        writer.flush()?;
    }
    file.persist(path).map_err(|err| CacheError::Io(err.error))?;
    Ok(())
}

fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .take(SEGMENT_MAX_LEN)
        .collect();

    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn record_read(result: &'static str) {
    counter!(METRIC_PERSISTENT_READ, "result" => result).increment(1);
}

/// Downcast a single-flight result to the caller's type.
pub(crate) fn typed<T: Any + Send + Sync>(result: FlightResult) -> Option<Arc<T>> {
    result.and_then(|data| data.downcast::<T>().ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use tempfile::TempDir;
    use time::Duration;

    use super::*;

    fn item(key: &str, data: &str, file_expires: OffsetDateTime) -> PersistentCacheItem<String> {
        PersistentCacheItem {
            cache_key: key.to_string(),
            site_name: Some("corp".to_string()),
            data: data.to_string(),
            dependencies: CacheDependency::from_keys(["news_list"]),
            cache_minutes: 10,
            expires: None,
            file_expires,
        }
    }

    #[test]
    fn path_layout_buckets_by_site_segment_and_hash() {
        let store = PersistentStore::new("/var/cache/app");
        let path = store.path_for("news|detail|1", Some("corp"));
        let relative = path.strip_prefix("/var/cache/app").expect("under root");
        let parts: Vec<String> = relative.iter().map(|part| part.to_string_lossy().into_owned()).collect();

        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "corp");
        assert_eq!(parts[1], "news");
        assert_eq!(parts[2].len(), 2);
        assert!(parts[3].starts_with("13_"));
        assert!(parts[3].ends_with(".cache"));
        assert!(parts[3][3..].starts_with(parts[2].as_str()));
    }

    #[test]
    fn path_is_deterministic_and_site_scoped() {
        let store = PersistentStore::new("root");
        assert_eq!(store.path_for("k|1", None), store.path_for("k|1", None));
        assert_ne!(store.path_for("k|1", Some("a")), store.path_for("k|1", Some("b")));
        assert!(store.path_for("k|1", None).starts_with("root/_Global"));
    }

    #[test]
    fn illegal_segment_characters_are_replaced() {
        let store = PersistentStore::new("root");
        let path = store.path_for("../etc:passwd|x", Some("a/b"));
        let relative = path.strip_prefix("root").expect("under root");
        let parts: Vec<String> = relative.iter().map(|part| part.to_string_lossy().into_owned()).collect();
        assert_eq!(parts[0], "a_b");
        assert_eq!(parts[1], "_etc_passwd");
    }

    #[test]
    fn write_then_read_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentStore::new(dir.path());
        let now = OffsetDateTime::now_utc();
        let stored = item("news|1", "payload", now + Duration::hours(1));

        assert!(store.write(&stored));
        let restored: PersistentCacheItem<String> =
            store.read("news|1", Some("corp"), now).expect("restored item");
        assert_eq!(restored, stored);
        assert_eq!(store.disk_reads(), 1);
    }

    #[test]
    fn expired_file_is_deleted_on_read() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentStore::new(dir.path());
        let now = OffsetDateTime::now_utc();
        assert!(store.write(&item("old|1", "payload", now - Duration::seconds(1))));

        assert!(store.read::<String>("old|1", Some("corp"), now).is_none());
        assert!(!store.path_for("old|1", Some("corp")).exists());
    }

    #[test]
    fn corrupt_file_is_deleted_on_read() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentStore::new(dir.path());
        let path = store.path_for("bad|1", None);
        fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
        fs::write(&path, b"{not json").expect("write corrupt file");

        assert!(store.read::<String>("bad|1", None, OffsetDateTime::now_utc()).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn delete_is_best_effort() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentStore::new(dir.path());
        store.delete("never|written", None);

        let now = OffsetDateTime::now_utc();
        assert!(store.write(&item("news|2", "x", now + Duration::hours(1))));
        store.delete("news|2", Some("corp"));
        assert!(!store.path_for("news|2", Some("corp")).exists());
    }

    #[test]
    fn inspect_reads_header_only() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentStore::new(dir.path());
        let file_expires = OffsetDateTime::now_utc() + Duration::hours(2);
        assert!(store.write(&item("news|3", "x", file_expires)));

        let header = store
            .inspect("news|3", Some("corp"))
            .expect("inspect succeeds")
            .expect("header present");
        assert_eq!(header.cache_key, "news|3");
        assert_eq!(header.dependencies.cache_keys(), ["news_list"]);
        assert!(store.inspect("news|404", Some("corp")).expect("inspect").is_none());
    }

    #[test]
    fn sweep_removes_expired_and_corrupt_files() {
        let dir = TempDir::new().expect("temp dir");
        let store = PersistentStore::new(dir.path());
        let now = OffsetDateTime::now_utc();
        assert!(store.write(&item("live|1", "x", now + Duration::hours(1))));
        assert!(store.write(&item("dead|1", "x", now - Duration::hours(1))));
        let corrupt = store.path_for("junk|1", None);
        fs::create_dir_all(corrupt.parent().expect("parent")).expect("create dirs");
        fs::write(&corrupt, b"garbage").expect("write corrupt file");

        let report = store.sweep_expired(now);
        assert_eq!(
            report,
            SweepReport {
                scanned: 3,
                expired: 1,
                corrupt: 1,
            }
        );
        assert!(store.path_for("live|1", Some("corp")).exists());
    }

    #[test]
    fn sweep_of_missing_root_is_empty() {
        let store = PersistentStore::new("/nonexistent/farmcache-root");
        assert_eq!(store.sweep_expired(OffsetDateTime::now_utc()), SweepReport::default());
    }

    #[test]
    fn concurrent_flights_share_one_restore() {
        let store = Arc::new(PersistentStore::new("unused"));
        let restores = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let restores = Arc::clone(&restores);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let result = store.single_flight("news|1", || {
                        restores.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(std::time::Duration::from_millis(100));
                        Some(Arc::new("value".to_string()) as SharedData)
                    });
                    typed::<String>(result).expect("flight result")
                })
            })
            .collect();

        let results: Vec<Arc<String>> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread completes"))
            .collect();

        assert_eq!(restores.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert!(store.flights.is_empty());
    }
}
