//! Persistent per-scope metadata cache.
//!
//! One JSON document per (command, table, destination) scope, stored under
//! the user cache directory with owner-only permissions. The cache is what
//! makes re-runs cheap: row counts are reused for 24 hours and file
//! metadata (sizes, content hash, multipart tag) is reused until the object
//! key changes, so an unchanged partition costs one HEAD instead of a full
//! extract-compress-upload pass.
//!
//! Readers other than the owning process (the viewer) open these files
//! read-only and must tolerate a half-written document; writes here are
//! atomic renames so that never actually produces torn JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How long a cached row count stays fresh.
const ROW_COUNT_TTL_HOURS: i64 = 24;

/// How long a recorded error is kept before being cleaned.
const ERROR_TTL_DAYS: i64 = 7;

const LEGACY_SINGLE_FILE: &str = "cache.json";
const LEGACY_COUNTS_FILE: &str = "counts.json";

/// Namespacing triple for one cache file. Two runs with different
/// destinations never share entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    pub command: String,
    pub table: String,
    pub destination: String,
}

impl CacheScope {
    pub fn new(
        command: impl Into<String>,
        table: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            table: table.into(),
            destination: destination.into(),
        }
    }

    /// Stable identifier: readable prefix plus a hash of the destination so
    /// distinct destinations get distinct files.
    pub fn id(&self) -> String {
        let digest = md5::compute(format!(
            "{}|{}|{}",
            self.command, self.table, self.destination
        ));
        format!("{}-{}-{}", self.command, self.table, &hex::encode(digest.0)[..8])
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.id())
    }
}

/// Everything remembered about one partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub row_count: i64,
    #[serde(default)]
    pub count_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub uncompressed_size: u64,
    #[serde(default)]
    pub file_md5: String,
    #[serde(default)]
    pub multipart_etag: String,
    #[serde(default)]
    pub file_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub s3_key: String,
    #[serde(default)]
    pub s3_uploaded: bool,
    #[serde(default)]
    pub s3_upload_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub error_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub process_start_time: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn clear_row_count(&mut self) {
        self.row_count = 0;
        self.count_time = None;
    }

    fn clear_file_metadata(&mut self) {
        self.file_size = 0;
        self.uncompressed_size = 0;
        self.file_md5.clear();
        self.multipart_etag.clear();
        self.file_time = None;
        self.s3_key.clear();
        self.s3_uploaded = false;
        self.s3_upload_time = None;
    }

    fn is_empty(&self) -> bool {
        self.count_time.is_none() && self.file_md5.is_empty() && self.last_error.is_empty()
    }
}

/// File metadata returned by a cache probe.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub size: u64,
    pub uncompressed_size: u64,
    pub md5: String,
    pub multipart_etag: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheDocument {
    #[serde(default)]
    entries: HashMap<String, CacheEntry>,
}

/// In-memory view of one scope's cache file. A single process owns the
/// writer side for the duration of a run.
#[derive(Debug)]
pub struct MetadataCache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
}

/// Default cache directory: `<user cache dir>/pgarchive`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pgarchive")
}

impl MetadataCache {
    /// Load the scope's cache file, attempting one-shot migration from the
    /// legacy layouts when it does not exist yet. Corruption is downgraded
    /// to an empty cache with a warning; a cache is an optimisation, not a
    /// source of truth.
    pub fn load(scope: &CacheScope, dir: &Path) -> Self {
        let path = dir.join(scope.file_name());
        if !path.exists() {
            migrate_legacy_single_file(dir);
            migrate_legacy_counts_file(scope, dir, &path);
        }

        let entries = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice::<CacheDocument>(&raw) {
                Ok(doc) => doc.entries,
                Err(e) => {
                    warn!(
                        "Cache file {} is corrupted ({}), starting with an empty cache",
                        path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self { path, entries }
    }

    /// Atomically persist the cache with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }
        let doc = CacheDocument {
            entries: self.entries.clone(),
        };
        let raw = serde_json::to_vec_pretty(&doc).context("serializing cache")?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "cache.json".to_string());
        let tmp = self.path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, &raw).with_context(|| format!("writing {}", tmp.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("setting permissions on {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path).with_context(|| {
            format!("renaming {} to {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }

    pub fn entry(&self, partition: &str) -> Option<&CacheEntry> {
        self.entries.get(partition)
    }

    /// Cached row count, or a miss when the count is stale or the partition
    /// date is today or in the future. `now` is injected so tests control
    /// the clock.
    pub fn get_row_count(
        &mut self,
        partition: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<i64> {
        let entry = self.entries.get_mut(partition)?;
        let counted_at = entry.count_time?;
        if date >= now.date_naive() {
            debug!("Row count for {partition} not cached: partition is current or future");
            entry.clear_row_count();
            return None;
        }
        if now - counted_at > Duration::hours(ROW_COUNT_TTL_HOURS) {
            debug!("Row count for {partition} expired");
            entry.clear_row_count();
            return None;
        }
        Some(entry.row_count)
    }

    pub fn set_row_count(&mut self, partition: &str, count: i64, now: DateTime<Utc>) {
        let entry = self.entries.entry(partition.to_string()).or_default();
        entry.row_count = count.max(0);
        entry.count_time = Some(now);
    }

    /// Cached file metadata for `key`, or a miss when the entry belongs to
    /// a different key (the path template changed) or the partition date is
    /// today or in the future. File metadata never expires by age.
    pub fn get_file_metadata(
        &mut self,
        partition: &str,
        key: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<FileMetadata> {
        let entry = self.entries.get_mut(partition)?;
        if entry.file_md5.is_empty() {
            return None;
        }
        if entry.s3_key != key {
            debug!(
                "Cached file metadata for {partition} is for key {}, not {key}; invalidating",
                entry.s3_key
            );
            entry.clear_file_metadata();
            return None;
        }
        if date >= now.date_naive() {
            debug!("File metadata for {partition} not used: partition is current or future");
            return None;
        }
        Some(FileMetadata {
            size: entry.file_size,
            uncompressed_size: entry.uncompressed_size,
            md5: entry.file_md5.clone(),
            multipart_etag: entry.multipart_etag.clone(),
        })
    }

    /// Record the outcome of a format-compress-upload pass. Clears any
    /// previous error for the partition.
    #[allow(clippy::too_many_arguments)]
    pub fn set_file_metadata(
        &mut self,
        partition: &str,
        key: &str,
        compressed_size: u64,
        uncompressed_size: u64,
        md5: &str,
        multipart_etag: &str,
        uploaded: bool,
        process_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        debug_assert!(
            !uploaded || (!key.is_empty() && !md5.is_empty() && compressed_size > 0),
            "an uploaded entry must carry a key, hash and size"
        );
        let entry = self.entries.entry(partition.to_string()).or_default();
        entry.file_size = compressed_size;
        entry.uncompressed_size = uncompressed_size;
        entry.file_md5 = md5.to_string();
        entry.multipart_etag = multipart_etag.to_string();
        entry.file_time = Some(now);
        entry.s3_key = key.to_string();
        entry.s3_uploaded = uploaded;
        entry.s3_upload_time = if uploaded { Some(now) } else { None };
        entry.process_start_time = Some(process_start);
        entry.last_error.clear();
        entry.error_time = None;
    }

    /// Record a failure without disturbing file metadata.
    pub fn set_error(&mut self, partition: &str, message: &str, now: DateTime<Utc>) {
        let entry = self.entries.entry(partition.to_string()).or_default();
        entry.last_error = message.to_string();
        entry.error_time = Some(now);
    }

    /// Drop stale row counts, old errors, and entries left with nothing
    /// useful in them.
    pub fn clean_expired(&mut self, now: DateTime<Utc>) {
        for entry in self.entries.values_mut() {
            if let Some(counted_at) = entry.count_time
                && now - counted_at > Duration::hours(ROW_COUNT_TTL_HOURS)
            {
                entry.clear_row_count();
            }
            if let Some(errored_at) = entry.error_time
                && now - errored_at > Duration::days(ERROR_TTL_DAYS)
            {
                entry.last_error.clear();
                entry.error_time = None;
            }
        }
        self.entries.retain(|_, e| !e.is_empty());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Migrate this scope out of the pre-split single cache file, which held
/// every scope keyed by scope id. All scopes are split into their own files
/// in one pass and the legacy file is removed.
fn migrate_legacy_single_file(dir: &Path) {
    let legacy = dir.join(LEGACY_SINGLE_FILE);
    let Ok(raw) = fs::read(&legacy) else {
        return;
    };
    let parsed: HashMap<String, HashMap<String, CacheEntry>> = match serde_json::from_slice(&raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                "Legacy cache file {} is unreadable ({}), ignoring it",
                legacy.display(),
                e
            );
            return;
        }
    };
    info!(
        "Migrating legacy cache file {} ({} scopes)",
        legacy.display(),
        parsed.len()
    );
    for (scope_id, entries) in parsed {
        let cache = MetadataCache {
            path: dir.join(format!("{scope_id}.json")),
            entries,
        };
        if let Err(e) = cache.save() {
            warn!("Failed to migrate legacy scope {scope_id}: {e:#}");
        }
    }
    if let Err(e) = fs::remove_file(&legacy) {
        warn!("Failed to remove migrated legacy file {}: {e}", legacy.display());
    }
}

/// Migrate the counts-only layout from before file metadata existed. Those
/// files predate scoping, so the counts land in the requesting scope.
fn migrate_legacy_counts_file(scope: &CacheScope, dir: &Path, scope_path: &Path) {
    if scope_path.exists() {
        return;
    }
    let legacy = dir.join(LEGACY_COUNTS_FILE);
    let Ok(raw) = fs::read(&legacy) else {
        return;
    };

    #[derive(Deserialize)]
    struct LegacyCount {
        #[serde(default)]
        count: i64,
        #[serde(default)]
        time: Option<DateTime<Utc>>,
    }

    let parsed: HashMap<String, LegacyCount> = match serde_json::from_slice(&raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(
                "Legacy counts file {} is unreadable ({}), ignoring it",
                legacy.display(),
                e
            );
            return;
        }
    };
    info!(
        "Migrating legacy counts file {} into scope {}",
        legacy.display(),
        scope.id()
    );
    let entries: HashMap<String, CacheEntry> = parsed
        .into_iter()
        .map(|(partition, c)| {
            (
                partition,
                CacheEntry {
                    row_count: c.count.max(0),
                    count_time: c.time,
                    ..CacheEntry::default()
                },
            )
        })
        .collect();
    let cache = MetadataCache {
        path: scope_path.to_path_buf(),
        entries,
    };
    if let Err(e) = cache.save() {
        warn!("Failed to migrate legacy counts file: {e:#}");
        return;
    }
    if let Err(e) = fs::remove_file(&legacy) {
        warn!("Failed to remove migrated counts file {}: {e}", legacy.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scope() -> CacheScope {
        CacheScope::new("archive", "flights", "s3://bucket/export/{table}")
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 0, 0).unwrap()
    }

    fn past_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    #[test]
    fn scope_ids_differ_by_destination() {
        let a = CacheScope::new("archive", "flights", "s3://bucket/a");
        let b = CacheScope::new("archive", "flights", "s3://bucket/b");
        assert_ne!(a.id(), b.id());
        // and are stable across calls
        assert_eq!(a.id(), a.id());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_row_count("flights_20240315", 1000, now());
        cache.set_file_metadata(
            "flights_20240315",
            "export/flights/2024/03/flights-2024-03-15.jsonl.zst",
            2048,
            8192,
            "d41d8cd98f00b204e9800998ecf8427e",
            "",
            true,
            now(),
            now(),
        );
        cache.save().unwrap();

        let mut reloaded = MetadataCache::load(&scope(), dir.path());
        assert_eq!(
            reloaded.get_row_count("flights_20240315", past_date(), now()),
            Some(1000)
        );
        let meta = reloaded
            .get_file_metadata(
                "flights_20240315",
                "export/flights/2024/03/flights-2024-03-15.jsonl.zst",
                past_date(),
                now(),
            )
            .unwrap();
        assert_eq!(meta.size, 2048);
        assert_eq!(meta.uncompressed_size, 8192);
        assert_eq!(meta.md5, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[cfg(unix)]
    #[test]
    fn cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_row_count("p", 1, now());
        cache.save().unwrap();
        let mode = fs::metadata(dir.path().join(scope().file_name()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn row_count_expires_after_24h() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_row_count("p", 500, now());
        assert_eq!(cache.get_row_count("p", past_date(), now()), Some(500));
        let later = now() + Duration::hours(25);
        assert_eq!(cache.get_row_count("p", past_date(), later), None);
        // the miss also cleared the fields
        assert!(cache.entry("p").unwrap().count_time.is_none());
    }

    #[test]
    fn today_and_future_are_never_cached() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        let today = now().date_naive();
        cache.set_row_count("p", 500, now());
        cache.set_file_metadata("p", "k", 10, 20, "abc", "", true, now(), now());
        assert_eq!(cache.get_row_count("p", today, now()), None);
        assert_eq!(cache.get_file_metadata("p", "k", today, now()), None);
        let future = today + Duration::days(3);
        assert_eq!(cache.get_file_metadata("p", "k", future, now()), None);
    }

    #[test]
    fn key_change_invalidates_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_file_metadata("p", "old/key", 10, 20, "abc", "", true, now(), now());
        assert_eq!(cache.get_file_metadata("p", "new/key", past_date(), now()), None);
        // invalidation is sticky: the old key's metadata is gone too
        assert_eq!(cache.get_file_metadata("p", "old/key", past_date(), now()), None);
    }

    #[test]
    fn set_error_preserves_file_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_file_metadata("p", "k", 10, 20, "abc", "", true, now(), now());
        cache.set_error("p", "connection reset", now());
        let entry = cache.entry("p").unwrap();
        assert_eq!(entry.last_error, "connection reset");
        assert_eq!(entry.file_md5, "abc");
        assert!(entry.s3_uploaded);
    }

    #[test]
    fn successful_metadata_clears_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_error("p", "boom", now());
        cache.set_file_metadata("p", "k", 10, 20, "abc", "", true, now(), now());
        assert!(cache.entry("p").unwrap().last_error.is_empty());
    }

    #[test]
    fn clean_expired_drops_stale_and_empty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        cache.set_row_count("stale_count", 5, now() - Duration::hours(30));
        cache.set_error("old_error", "boom", now() - Duration::days(8));
        cache.set_file_metadata("keeper", "k", 10, 20, "abc", "", true, now(), now());
        cache.clean_expired(now());
        assert!(cache.entry("stale_count").is_none());
        assert!(cache.entry("old_error").is_none());
        assert!(cache.entry("keeper").is_some());
    }

    #[test]
    fn corrupted_file_yields_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(scope().file_name());
        fs::write(&path, b"{ not json").unwrap();
        let cache = MetadataCache::load(&scope(), dir.path());
        assert!(cache.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(scope().file_name());
        fs::write(
            &path,
            br#"{"entries":{"p":{"row_count":7,"count_time":"2024-03-20T00:00:00Z","some_future_field":true}}}"#,
        )
        .unwrap();
        let mut cache = MetadataCache::load(&scope(), dir.path());
        assert_eq!(cache.get_row_count("p", past_date(), now()), Some(7));
    }

    #[test]
    fn legacy_single_file_is_migrated_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let s = scope();
        let legacy = serde_json::json!({
            s.id(): {
                "flights_20240315": { "row_count": 42, "count_time": "2024-03-20T00:00:00Z" }
            },
            "other-scope-deadbeef": {
                "x_20240101": { "row_count": 1, "count_time": "2024-03-20T00:00:00Z" }
            }
        });
        fs::write(
            dir.path().join(LEGACY_SINGLE_FILE),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();

        let mut cache = MetadataCache::load(&s, dir.path());
        assert_eq!(cache.get_row_count("flights_20240315", past_date(), now()), Some(42));
        assert!(!dir.path().join(LEGACY_SINGLE_FILE).exists());
        // the other scope survived the split
        assert!(dir.path().join("other-scope-deadbeef.json").exists());
    }

    #[test]
    fn legacy_counts_file_is_migrated_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = serde_json::json!({
            "flights_20240315": { "count": 9, "time": "2024-03-20T00:00:00Z" }
        });
        fs::write(
            dir.path().join(LEGACY_COUNTS_FILE),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();

        let mut cache = MetadataCache::load(&scope(), dir.path());
        assert_eq!(cache.get_row_count("flights_20240315", past_date(), now()), Some(9));
        assert!(!dir.path().join(LEGACY_COUNTS_FILE).exists());
    }
}
