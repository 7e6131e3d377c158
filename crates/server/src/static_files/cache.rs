//! File entry caching
//!
//! Entries are partitioned by negotiated encoding and reference counted.
//! A background sweep removes stale entries from the index and releases
//! them once their last reader is gone.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::compression::ContentEncoding;
use super::entry::FileEntry;

/// Store of file entries shared by all requests
pub trait CacheManager: Send + Sync + fmt::Debug {
    /// Look up an entry, counting the caller as a reader on hit
    fn get(&self, encoding: ContentEncoding, key: &str) -> Option<Arc<FileEntry>>;

    /// Store `candidate` unless an entry already exists for the key.
    ///
    /// The returned entry (stored or pre-existing) counts the caller as a
    /// reader. A losing candidate is released.
    fn put(&self, encoding: ContentEncoding, key: &str, candidate: FileEntry) -> Arc<FileEntry>;

    /// Run `work` while holding the partition lock for `encoding`
    fn with_lock(&self, encoding: ContentEncoding, work: &mut dyn FnMut());

    /// Drop one reader of `entry`
    fn release_reader(&self, entry: &FileEntry) {
        self.with_lock(entry.encoding(), &mut || {
            entry.release_one();
        });
    }

    /// Snapshot of cache occupancy
    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

/// Cache occupancy snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Indexed entries per partition, in [`ContentEncoding::index`] order
    pub entries: [usize; 4],
    /// Evicted entries waiting for their readers to finish
    pub pending: usize,
}

impl CacheStats {
    pub fn total_entries(&self) -> usize {
        self.entries.iter().sum()
    }

    pub fn entries_for(&self, encoding: ContentEncoding) -> usize {
        self.entries[encoding.index()]
    }
}

// ============================================================================
// In-memory Cache
// ============================================================================

type Partition = Mutex<HashMap<String, Arc<FileEntry>>>;

/// Cache holding entries for a fixed duration after creation
pub struct InMemoryCache {
    partitions: [Partition; 4],
    pending: Mutex<Vec<Arc<FileEntry>>>,
    duration: Duration,
}

impl fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryCache")
            .field("duration", &self.duration)
            .field("stats", &self.stats())
            .finish()
    }
}

impl InMemoryCache {
    /// Create a cache whose entries go stale after `duration`
    pub fn new(duration: Duration) -> Self {
        Self {
            partitions: Default::default(),
            pending: Mutex::new(Vec::new()),
            duration,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    fn partition(&self, encoding: ContentEncoding) -> &Partition {
        &self.partitions[encoding.index()]
    }

    /// Start the background sweep on the current tokio runtime.
    ///
    /// The task ticks every half cache duration and exits when `stop` is
    /// cancelled or the cache is dropped. Returns `None` outside a runtime.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        stop: Option<CancellationToken>,
    ) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, file cache will not be swept");
                return None;
            }
        };

        let cache: Weak<Self> = Arc::downgrade(self);
        let period = (self.duration / 2).max(Duration::from_millis(1));
        let stop = stop.unwrap_or_default();

        Some(handle.spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!("File cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match cache.upgrade() {
                            Some(cache) => cache.sweep(),
                            None => break,
                        }
                    }
                }
            }
        }))
    }

    /// Evict stale entries and release unreferenced ones.
    ///
    /// Entries deferred by an earlier sweep are released first if their
    /// readers are gone. Stale entries always leave the index; those still
    /// being read are deferred to the next sweep.
    pub fn sweep(&self) {
        let deferred = std::mem::take(&mut *self.pending.lock());
        let mut still_pending = Vec::new();
        let mut released = 0usize;

        for entry in deferred {
            let partition = self.partition(entry.encoding()).lock();
            if entry.reader_count() == 0 {
                entry.release();
                released += 1;
            } else {
                still_pending.push(Arc::clone(&entry));
            }
            drop(partition);
        }

        let mut evicted = 0usize;
        for partition in &self.partitions {
            let mut map = partition.lock();
            map.retain(|key, entry| {
                if entry.age() <= self.duration {
                    return true;
                }
                evicted += 1;
                if entry.reader_count() == 0 {
                    entry.release();
                    released += 1;
                } else {
                    trace!(key = %key, readers = entry.reader_count(), "Deferring release of busy entry");
                    still_pending.push(Arc::clone(entry));
                }
                false
            });
        }

        let pending = still_pending.len();
        self.pending.lock().extend(still_pending);

        if evicted > 0 || released > 0 || pending > 0 {
            debug!(
                evicted = evicted,
                released = released,
                pending = pending,
                "File cache sweep completed"
            );
        }
    }
}

impl CacheManager for InMemoryCache {
    fn get(&self, encoding: ContentEncoding, key: &str) -> Option<Arc<FileEntry>> {
        let map = self.partition(encoding).lock();
        let entry = map.get(key)?;
        entry.acquire();
        Some(Arc::clone(entry))
    }

    fn put(&self, encoding: ContentEncoding, key: &str, candidate: FileEntry) -> Arc<FileEntry> {
        let mut map = self.partition(encoding).lock();
        if let Some(existing) = map.get(key) {
            existing.acquire();
            let existing = Arc::clone(existing);
            drop(map);
            trace!(key = %key, encoding = encoding.as_str(), "Lost cache insert race");
            candidate.release();
            return existing;
        }

        let entry = Arc::new(candidate);
        entry.acquire();
        map.insert(key.to_string(), Arc::clone(&entry));
        entry
    }

    fn with_lock(&self, encoding: ContentEncoding, work: &mut dyn FnMut()) {
        let _guard = self.partition(encoding).lock();
        work();
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats::default();
        for encoding in ContentEncoding::ALL {
            stats.entries[encoding.index()] = self.partition(encoding).lock().len();
        }
        stats.pending = self.pending.lock().len();
        stats
    }
}

// ============================================================================
// No-op Cache
// ============================================================================

/// Cache that stores nothing; every entry is owned by a single request
#[derive(Debug, Default)]
pub struct NoopCache {
    lock: Mutex<()>,
}

impl NoopCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheManager for NoopCache {
    fn get(&self, _encoding: ContentEncoding, _key: &str) -> Option<Arc<FileEntry>> {
        None
    }

    fn put(&self, _encoding: ContentEncoding, _key: &str, candidate: FileEntry) -> Arc<FileEntry> {
        let _guard = self.lock.lock();
        candidate.acquire();
        Arc::new(candidate)
    }

    fn with_lock(&self, _encoding: ContentEncoding, work: &mut dyn FnMut()) {
        let _guard = self.lock.lock();
        work();
    }

    fn release_reader(&self, entry: &FileEntry) {
        let _guard = self.lock.lock();
        if entry.release_one() == 0 {
            entry.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::SystemTime;

    fn entry(name: &str) -> FileEntry {
        FileEntry::in_memory(
            name,
            Bytes::from_static(b"content"),
            "text/plain",
            SystemTime::now(),
            ContentEncoding::Identity,
            false,
        )
    }

    #[test]
    fn test_first_writer_wins() {
        let cache = InMemoryCache::new(Duration::from_secs(10));
        let first = cache.put(ContentEncoding::Identity, "/a", entry("first"));
        let second = cache.put(ContentEncoding::Identity, "/a", entry("second"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.source(), "first");
        assert_eq!(first.reader_count(), 2);

        let hit = cache.get(ContentEncoding::Identity, "/a").unwrap();
        assert!(Arc::ptr_eq(&first, &hit));
        assert_eq!(first.reader_count(), 3);
    }

    #[test]
    fn test_partitions_are_independent() {
        let cache = InMemoryCache::new(Duration::from_secs(10));
        cache.put(ContentEncoding::Gzip, "/a", entry("gzip"));

        assert!(cache.get(ContentEncoding::Identity, "/a").is_none());
        assert!(cache.get(ContentEncoding::Brotli, "/a").is_none());
        assert!(cache.get(ContentEncoding::Gzip, "/a").is_some());

        let stats = cache.stats();
        assert_eq!(stats.entries_for(ContentEncoding::Gzip), 1);
        assert_eq!(stats.total_entries(), 1);
    }

    #[test]
    fn test_release_reader_saturates_at_zero() {
        let cache = InMemoryCache::new(Duration::from_secs(10));
        let e = cache.put(ContentEncoding::Identity, "/a", entry("a"));
        cache.release_reader(&e);
        cache.release_reader(&e);
        assert_eq!(e.reader_count(), 0);
    }

    #[test]
    fn test_sweep_defers_busy_entries() {
        let cache = InMemoryCache::new(Duration::ZERO);
        let busy = cache.put(ContentEncoding::Identity, "/busy", entry("busy"));
        let idle = cache.put(ContentEncoding::Identity, "/idle", entry("idle"));
        cache.release_reader(&idle);
        std::thread::sleep(Duration::from_millis(5));

        cache.sweep();
        assert!(idle.is_released());
        assert!(!busy.is_released());
        assert!(cache.get(ContentEncoding::Identity, "/busy").is_none());
        assert_eq!(cache.stats().pending, 1);

        // Still read: stays pending
        cache.sweep();
        assert!(!busy.is_released());
        assert_eq!(cache.stats().pending, 1);

        cache.release_reader(&busy);
        cache.sweep();
        assert!(busy.is_released());
        assert_eq!(cache.stats().pending, 0);
    }

    #[test]
    fn test_fresh_entries_survive_sweep() {
        let cache = InMemoryCache::new(Duration::from_secs(60));
        let e = cache.put(ContentEncoding::Zstd, "/a", entry("a"));
        cache.release_reader(&e);
        cache.sweep();
        assert!(!e.is_released());
        assert_eq!(cache.stats().entries_for(ContentEncoding::Zstd), 1);
    }

    #[test]
    fn test_noop_cache_releases_on_last_reader() {
        let cache = NoopCache::new();
        let e = cache.put(ContentEncoding::Identity, "/a", entry("a"));
        assert!(cache.get(ContentEncoding::Identity, "/a").is_none());
        assert_eq!(e.reader_count(), 1);

        cache.release_reader(&e);
        assert!(e.is_released());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let cache = Arc::new(InMemoryCache::new(Duration::from_millis(20)));
        let stop = CancellationToken::new();
        let handle = cache.spawn_sweeper(Some(stop.clone())).unwrap();

        let e = cache.put(ContentEncoding::Identity, "/a", entry("a"));
        cache.release_reader(&e);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(e.is_released());

        stop.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_sweeper_needs_runtime() {
        let cache = Arc::new(InMemoryCache::new(Duration::from_secs(1)));
        assert!(cache.spawn_sweeper(None).is_none());
    }
}
