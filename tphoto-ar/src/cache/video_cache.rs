//! Checksum-verified video cache
//!
//! Content-addressed store of generated videos. Blobs live under
//! `<dir>/videos/<key>.mp4`; metadata lives in the SQLite index.
//!
//! **Guarantees:**
//! - `get` only returns entries younger than the TTL whose file still hashes
//!   to the stored checksum; anything else is deleted and reported as a miss
//! - `put` evicts least-recently-accessed entries until the new entry fits,
//!   before anything is written
//! - Every mutation of one key happens under that key's lock
//! - Entries checked out for playback are never evicted for space; a leased
//!   blob whose entry is discarded is deleted when its last lease drops
//! - A put abandoned mid-write gives its reserved space back and leaves no
//!   file behind

use crate::cache::index::{self, IndexRow};
use crate::cache::keyed_lock::KeyedLocks;
use crate::checksum;
use crate::clock::{self, Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{CacheKey, VideoMeta};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tphoto_common::db::{init_cache_index, IndexLocation};
use tracing::{debug, info, warn};

/// Default size cap (500 MiB)
pub const DEFAULT_MAX_BYTES: u64 = 500 * 1024 * 1024;

/// Default entry lifetime (24 h)
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Cache placement and limits
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub ttl: Duration,
    pub index: IndexLocation,
}

impl CacheConfig {
    /// Defaults with the index stored as `<dir>/index.db`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            index: IndexLocation::File(dir.join("index.db")),
            dir,
            max_bytes: DEFAULT_MAX_BYTES,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Metadata for one cached video
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedVideoEntry {
    pub key: CacheKey,
    pub video_path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    /// Lip region and duration, when stored with the entry
    pub meta: Option<VideoMeta>,
}

impl From<IndexRow> for CachedVideoEntry {
    fn from(row: IndexRow) -> Self {
        Self {
            key: row.key,
            video_path: row.video_path,
            size_bytes: row.size_bytes,
            checksum: row.checksum,
            created_at: clock::from_millis(row.created_at_ms),
            last_accessed_at: clock::from_millis(row.last_accessed_at_ms),
            meta: None,
        }
    }
}

/// Cache counters and occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub corruptions: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    corruptions: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Default)]
struct PinState {
    counts: HashMap<CacheKey, usize>,
    /// Blobs whose index rows are gone but which are still leased
    doomed: HashMap<CacheKey, PathBuf>,
}

type PinTable = Arc<Mutex<PinState>>;

fn lock_pins(pins: &Mutex<PinState>) -> MutexGuard<'_, PinState> {
    match pins.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keeps an entry out of space eviction while held
#[derive(Debug)]
struct PinGuard {
    key: CacheKey,
    pins: PinTable,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut pins = lock_pins(&self.pins);
        let Some(count) = pins.counts.get_mut(&self.key) else {
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        pins.counts.remove(&self.key);

        // Removed under the pin lock: `put` clears the mark under the same
        // lock before it writes a new blob to this path
        if let Some(path) = pins.doomed.remove(&self.key) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(key = %self.key, "Deleted discarded video after last lease"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    key = %self.key,
                    path = %path.display(),
                    error = %e,
                    "Failed to delete discarded video"
                ),
            }
        }
    }
}

/// Space promised to one in-progress write, handed back on drop
#[derive(Debug)]
struct Reservation {
    size: u64,
    reserved: Arc<AtomicU64>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(self.size, Ordering::SeqCst);
    }
}

/// File written by an unfinished put; removed on drop unless kept
#[derive(Debug)]
struct PendingBlob {
    path: PathBuf,
    keep: bool,
}

impl PendingBlob {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Verified entry checked out for playback
#[derive(Debug)]
pub struct CacheLease {
    entry: CachedVideoEntry,
    _pin: PinGuard,
}

impl CacheLease {
    pub fn entry(&self) -> &CachedVideoEntry {
        &self.entry
    }

    pub fn path(&self) -> &Path {
        &self.entry.video_path
    }
}

/// On-disk video cache
pub struct VideoCache {
    config: CacheConfig,
    videos_dir: PathBuf,
    db: SqlitePool,
    locks: KeyedLocks,
    /// Serializes space checks; `reserved` only grows while this is held
    eviction: AsyncMutex<()>,
    /// Bytes promised to in-progress writes
    reserved: Arc<AtomicU64>,
    pins: PinTable,
    clock: Arc<dyn Clock>,
    counters: Counters,
}

impl VideoCache {
    /// Open the cache on the system clock
    pub async fn open(config: CacheConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Open the cache, sweeping expired entries, rows with missing files and
    /// orphan blobs
    pub async fn open_with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let videos_dir = config.dir.join("videos");
        tokio::fs::create_dir_all(&videos_dir).await?;

        let db = init_cache_index(&config.index).await?;

        let cache = Self {
            config,
            videos_dir,
            db,
            locks: KeyedLocks::new(),
            eviction: AsyncMutex::new(()),
            reserved: Arc::new(AtomicU64::new(0)),
            pins: Arc::new(Mutex::new(PinState::default())),
            clock,
            counters: Counters::default(),
        };

        cache.sweep().await?;

        info!(
            dir = %cache.config.dir.display(),
            max_bytes = cache.config.max_bytes,
            ttl_secs = cache.config.ttl.as_secs(),
            "Video cache ready"
        );

        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Verified entry for `key`, or None on miss
    ///
    /// Expired or corrupted entries are deleted here and reported as misses.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedVideoEntry>> {
        Ok(self.lookup(key).await?.map(|(entry, _guard)| entry))
    }

    /// Like `get`, but the entry stays pinned against space eviction until
    /// the lease is dropped
    pub async fn checkout(&self, key: &CacheKey) -> Result<Option<CacheLease>> {
        Ok(self
            .lookup(key)
            .await?
            .map(|(entry, pin)| CacheLease { entry, _pin: pin }))
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<(CachedVideoEntry, PinGuard)>> {
        let _guard = self.locks.lock(key).await;

        let Some(row) = index::get(&self.db, key).await? else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache miss");
            return Ok(None);
        };

        let now_ms = self.clock.now().timestamp_millis();
        if self.is_expired(&row, now_ms) {
            debug!(key = %key, "Cache entry expired, removing");
            self.discard(&row).await?;
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let intact = match checksum::sha256_file(&row.video_path).await {
            Ok(actual) if checksum::matches(&row.checksum, &actual) => true,
            Ok(actual) => {
                warn!(
                    key = %key,
                    expected = %row.checksum,
                    actual = %actual,
                    "{}",
                    Error::CacheCorruption("checksum mismatch on read".to_string())
                );
                false
            }
            Err(Error::Io(e)) => {
                warn!(
                    key = %key,
                    path = %row.video_path.display(),
                    error = %e,
                    "{}",
                    Error::CacheCorruption("cached file unreadable".to_string())
                );
                false
            }
            Err(e) => return Err(e),
        };

        if !intact {
            self.discard(&row).await?;
            self.counters.corruptions.fetch_add(1, Ordering::Relaxed);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        index::touch(&self.db, key, now_ms).await?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, size_bytes = row.size_bytes, "Cache hit");

        let meta = index::get_meta(&self.db, key).await?;
        let pin = self.pin(key);
        let mut entry = CachedVideoEntry::from(IndexRow {
            last_accessed_at_ms: now_ms,
            ..row
        });
        entry.meta = meta;
        Ok(Some((entry, pin)))
    }

    /// Store `bytes` under `key`
    ///
    /// `checksum` must match the bytes. Least-recently-accessed entries are
    /// evicted first if needed; fails with `StorageFull` if the entry cannot
    /// fit.
    pub async fn put(&self, key: &CacheKey, bytes: &[u8], checksum: &str) -> Result<CachedVideoEntry> {
        self.put_with_meta(key, bytes, checksum, None).await
    }

    /// `put`, recording playback metadata with the entry
    pub async fn put_with_meta(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        checksum: &str,
        meta: Option<&VideoMeta>,
    ) -> Result<CachedVideoEntry> {
        let actual = checksum::sha256_hex(bytes);
        if !checksum::matches(checksum, &actual) {
            return Err(Error::DownloadError(format!(
                "checksum mismatch for {}: expected {}, got {}",
                key, checksum, actual
            )));
        }

        let size = bytes.len() as u64;
        if size > self.config.max_bytes {
            return Err(Error::StorageFull {
                needed: size,
                capacity: self.config.max_bytes,
            });
        }

        let _guard = self.locks.lock(key).await;

        // Replacing an entry frees its space first
        if let Some(existing) = index::get(&self.db, key).await? {
            self.discard(&existing).await?;
        }
        // The new blob takes over the path; an old lease must not delete it
        lock_pins(&self.pins).doomed.remove(key);

        let _reservation = self.reserve(key, size).await?;
        let entry = self.write_entry(key, bytes, &actual, size, meta).await?;

        info!(key = %key, size_bytes = size, "Cached video");
        Ok(entry)
    }

    /// Make room for `size` bytes, evicting in LRU order
    async fn reserve(&self, key: &CacheKey, size: u64) -> Result<Reservation> {
        let capacity = self.config.max_bytes;
        let _eviction = self.eviction.lock().await;
        let mut used = index::total_size(&self.db).await? + self.reserved.load(Ordering::SeqCst);

        if used + size > capacity {
            for candidate in index::lru_order(&self.db).await? {
                if used + size <= capacity {
                    break;
                }
                if &candidate.key == key || self.is_pinned(&candidate.key) {
                    continue;
                }
                // Entries busy in another operation are skipped, not awaited
                let Some(_victim_guard) = self.locks.try_lock(&candidate.key) else {
                    continue;
                };
                if self.is_pinned(&candidate.key) {
                    continue;
                }
                let Some(victim) = index::get(&self.db, &candidate.key).await? else {
                    continue;
                };

                self.discard(&victim).await?;
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                used = used.saturating_sub(victim.size_bytes);
                info!(
                    key = %victim.key,
                    size_bytes = victim.size_bytes,
                    "Evicted least recently used video"
                );
            }
        }

        if used + size > capacity {
            warn!(
                key = %key,
                needed = size,
                used,
                capacity,
                "Cannot evict enough space"
            );
            return Err(Error::StorageFull {
                needed: size,
                capacity,
            });
        }

        self.reserved.fetch_add(size, Ordering::SeqCst);
        Ok(Reservation {
            size,
            reserved: Arc::clone(&self.reserved),
        })
    }

    async fn write_entry(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        checksum: &str,
        size: u64,
        meta: Option<&VideoMeta>,
    ) -> Result<CachedVideoEntry> {
        let path = self.blob_path(key);
        let mut pending = PendingBlob::new(path.with_extension("mp4.part"));

        tokio::fs::write(&pending.path, bytes).await?;
        tokio::fs::rename(&pending.path, &path).await?;
        pending.path = path.clone();

        let now_ms = self.clock.now().timestamp_millis();
        let row = IndexRow {
            key: key.clone(),
            video_path: path.clone(),
            size_bytes: size,
            checksum: checksum.to_string(),
            created_at_ms: now_ms,
            last_accessed_at_ms: now_ms,
        };

        let indexed = match meta {
            Some(meta) => match index::upsert_meta(&self.db, key, meta).await {
                Ok(()) => index::upsert(&self.db, &row).await,
                Err(e) => Err(e),
            },
            None => index::upsert(&self.db, &row).await,
        };
        if let Err(e) = indexed {
            let _ = index::delete(&self.db, key).await;
            return Err(e);
        }
        pending.keep = true;

        let mut entry = CachedVideoEntry::from(row);
        entry.meta = meta.copied();
        Ok(entry)
    }

    /// Delete all entries past their TTL; returns how many were removed
    pub async fn evict_expired(&self) -> Result<usize> {
        let now_ms = self.clock.now().timestamp_millis();
        let cutoff_ms = now_ms.saturating_sub(self.ttl_ms());
        let mut removed = 0;

        for candidate in index::created_before(&self.db, cutoff_ms).await? {
            let _guard = self.locks.lock(&candidate.key).await;
            // Re-read: the entry may have been replaced while we waited
            let Some(row) = index::get(&self.db, &candidate.key).await? else {
                continue;
            };
            if self.is_expired(&row, now_ms) {
                self.discard(&row).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Evicted expired videos");
        }
        Ok(removed)
    }

    /// Drop the entry for `key` if present
    pub async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let _guard = self.locks.lock(key).await;
        match index::get(&self.db, key).await? {
            Some(row) => {
                self.discard(&row).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Read an entry's bytes
    pub async fn read(&self, entry: &CachedVideoEntry) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&entry.video_path).await?)
    }

    pub async fn total_size(&self) -> Result<u64> {
        index::total_size(&self.db).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: index::count(&self.db).await?,
            total_bytes: index::total_size(&self.db).await?,
            capacity_bytes: self.config.max_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            corruptions: self.counters.corruptions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        })
    }

    async fn sweep(&self) -> Result<()> {
        self.evict_expired().await?;

        let mut known = HashSet::new();
        for row in index::lru_order(&self.db).await? {
            if tokio::fs::metadata(&row.video_path).await.is_err() {
                warn!(key = %row.key, path = %row.video_path.display(), "Cached file missing, dropping index row");
                index::delete(&self.db, &row.key).await?;
            } else {
                known.insert(row.video_path);
            }
        }

        index::delete_dangling_meta(&self.db).await?;

        let mut orphans = 0usize;
        let mut dir = tokio::fs::read_dir(&self.videos_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && !known.contains(&path) {
                tokio::fs::remove_file(&path).await?;
                orphans += 1;
            }
        }
        if orphans > 0 {
            info!(orphans, "Removed orphan cache files");
        }

        Ok(())
    }

    /// Remove row and blob; a blob pinned for playback is deleted when its
    /// last lease drops
    async fn discard(&self, row: &IndexRow) -> Result<()> {
        index::delete(&self.db, &row.key).await?;
        {
            let mut pins = lock_pins(&self.pins);
            if pins.counts.contains_key(&row.key) {
                pins.doomed.insert(row.key.clone(), row.video_path.clone());
                debug!(key = %row.key, "Discarded video still leased, deferring delete");
                return Ok(());
            }
        }
        match tokio::fs::remove_file(&row.video_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_expired(&self, row: &IndexRow, now_ms: i64) -> bool {
        now_ms.saturating_sub(row.created_at_ms) >= self.ttl_ms()
    }

    fn ttl_ms(&self) -> i64 {
        i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.videos_dir.join(format!("{}.mp4", key.as_str()))
    }

    fn pin(&self, key: &CacheKey) -> PinGuard {
        let mut pins = lock_pins(&self.pins);
        *pins.counts.entry(key.clone()).or_insert(0) += 1;
        PinGuard {
            key: key.clone(),
            pins: Arc::clone(&self.pins),
        }
    }

    fn is_pinned(&self, key: &CacheKey) -> bool {
        lock_pins(&self.pins).counts.contains_key(key)
    }
}
