use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use crate::error::Result;
use crate::storage::{ObjectInfo, ObjectStore};

pub const BLOCK_SIZE: u64 = 4096;
/// Synthetic free space added on top of the bucket's used bytes.
pub const HEADROOM_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const HEADROOM_FILES: u64 = 100_000;
const NAME_MAX: u32 = 255;

/// Filesystem statistics reported to `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub name_max: u32,
}

impl Capacity {
    /// Used space is the sum of non-directory sizes, rounded up to whole blocks.
    pub fn from_listing(listing: &[ObjectInfo]) -> Self {
        let (used_bytes, files) = listing
            .iter()
            .filter(|o| !o.is_dir)
            .fold((0u64, 0u64), |(bytes, n), o| (bytes + o.size, n + 1));
        let used_blocks = used_bytes.div_ceil(BLOCK_SIZE);
        let free_blocks = HEADROOM_BYTES / BLOCK_SIZE;
        Self {
            block_size: BLOCK_SIZE,
            total_blocks: used_blocks + free_blocks,
            free_blocks,
            total_files: files + HEADROOM_FILES,
            free_files: HEADROOM_FILES,
            name_max: NAME_MAX,
        }
    }

    /// Reported when the bucket cannot be listed, so the mount stays usable.
    pub fn fallback() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            total_blocks: 1_000_000_000,
            free_blocks: 500_000_000,
            total_files: 1_000_000,
            free_files: 1_000_000,
            name_max: NAME_MAX,
        }
    }

    pub fn used_bytes(&self) -> u64 {
        (self.total_blocks - self.free_blocks) * self.block_size
    }
}

#[derive(Debug)]
struct Snapshot<T> {
    value: T,
    fetched_at: Instant,
}

impl<T> Snapshot<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    fn fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Default)]
struct CacheState {
    listing: Option<Snapshot<Arc<Vec<ObjectInfo>>>>,
    capacity: Option<Snapshot<Capacity>>,
    /// Bumped by every invalidation; a refresh that raced one is not stored.
    epoch: u64,
}

/// Short-lived memo of the whole-bucket listing and the statistics derived
/// from it. One instance per mounted bucket.
#[derive(Debug)]
pub struct ListingCache {
    state: RwLock<CacheState>,
    list_ttl: Duration,
    capacity_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl ListingCache {
    pub fn new(list_ttl: Duration, capacity_ttl: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            list_ttl,
            capacity_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cached listing if younger than the listing TTL, otherwise a fresh
    /// recursive listing of the whole bucket.
    pub async fn listing(&self, store: &dyn ObjectStore) -> Result<Arc<Vec<ObjectInfo>>> {
        let epoch = {
            let state = self.read_state();
            if let Some(snapshot) = state.listing.as_ref().filter(|s| s.fresh(self.list_ttl)) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("listing cache hit: {} objects", snapshot.value.len());
                return Ok(Arc::clone(&snapshot.value));
            }
            state.epoch
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        let objects = Arc::new(store.list("").await?);

        let mut state = self.write_state();
        if state.epoch == epoch {
            state.listing = Some(Snapshot::new(Arc::clone(&objects)));
            debug!("listing cache refreshed: {} objects", objects.len());
        } else {
            debug!("listing cache: refresh raced an invalidation, not stored");
        }
        Ok(objects)
    }

    /// Capacity derived from the listing, memoized for the capacity TTL.
    /// Listing failures yield [`Capacity::fallback`].
    pub async fn capacity(&self, store: &dyn ObjectStore) -> Capacity {
        let epoch = {
            let state = self.read_state();
            if let Some(snapshot) = state.capacity.as_ref().filter(|s| s.fresh(self.capacity_ttl)) {
                return snapshot.value;
            }
            state.epoch
        };

        let listing = match self.listing(store).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("capacity: listing failed, reporting synthetic capacity: {}", e);
                return Capacity::fallback();
            }
        };
        let capacity = Capacity::from_listing(&listing);

        let mut state = self.write_state();
        if state.epoch == epoch {
            state.capacity = Some(Snapshot::new(capacity));
        }
        info!(
            "capacity computed: used={} bytes, total blocks={}, files={}",
            capacity.used_bytes(),
            capacity.total_blocks,
            capacity.total_files - capacity.free_files
        );
        capacity
    }

    /// Drops both snapshots.
    pub fn invalidate(&self) {
        let mut state = self.write_state();
        state.listing = None;
        state.capacity = None;
        state.epoch += 1;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!("caches invalidated (epoch {})", state.epoch);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.read_state();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            cached_objects: state.listing.as_ref().map(|s| s.value.len()),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub cached_objects: Option<usize>,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "listing cache: hits={}, misses={}, invalidations={}, cached={}",
            self.hits,
            self.misses,
            self.invalidations,
            self.cached_objects.map_or_else(|| "none".to_string(), |n| n.to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreOp};
    use std::time::SystemTime;

    fn cache() -> ListingCache {
        ListingCache::new(Duration::from_secs(60), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_listing_is_memoized() {
        let store = MemoryStore::with_objects([("a", "1"), ("b/c", "22")]);
        let cache = cache();

        assert_eq!(cache.listing(&store).await.unwrap().len(), 2);
        assert_eq!(cache.listing(&store).await.unwrap().len(), 2);
        assert_eq!(store.list_calls(), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.cached_objects, Some(2));
    }

    #[tokio::test]
    async fn test_listing_expiry() {
        let store = MemoryStore::with_objects([("a", "1")]);
        let cache = ListingCache::new(Duration::from_millis(50), Duration::from_secs(60));

        cache.listing(&store).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        cache.listing(&store).await.unwrap();
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let store = MemoryStore::with_objects([("a", "1")]);
        let cache = cache();

        cache.listing(&store).await.unwrap();
        cache.capacity(&store).await;
        store.insert("b", "2");
        cache.invalidate();

        assert_eq!(cache.stats().cached_objects, None);
        assert_eq!(cache.listing(&store).await.unwrap().len(), 2);
        assert_eq!(store.list_calls(), 2);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[tokio::test]
    async fn test_listing_error_propagates() {
        let store = MemoryStore::new();
        store.fail_all(StoreOp::List);
        assert!(cache().listing(&store).await.is_err());
    }

    #[tokio::test]
    async fn test_capacity_math() {
        let store = MemoryStore::with_objects([
            ("dir/", Vec::new()),
            ("dir/a", vec![0u8; 4096]),
            ("b", vec![0u8; 1]),
        ]);
        let capacity = cache().capacity(&store).await;
        let headroom = HEADROOM_BYTES / BLOCK_SIZE;
        assert_eq!(capacity.block_size, 4096);
        assert_eq!(capacity.free_blocks, headroom);
        assert_eq!(capacity.total_blocks, headroom + 2);
        assert_eq!(capacity.total_files, 2 + 100_000);
        assert_eq!(capacity.free_files, 100_000);
        assert_eq!(capacity.used_bytes(), 2 * 4096);
    }

    #[tokio::test]
    async fn test_capacity_memoized_and_fallback() {
        let store = MemoryStore::with_objects([("a", "1")]);
        let cache = cache();
        let first = cache.capacity(&store).await;
        store.insert("big", vec![0u8; 8192]);
        assert_eq!(cache.capacity(&store).await, first);

        cache.invalidate();
        store.fail_all(StoreOp::List);
        assert_eq!(cache.capacity(&store).await, Capacity::fallback());
    }

    #[test]
    fn test_capacity_from_empty_listing() {
        let capacity = Capacity::from_listing(&[]);
        assert_eq!(capacity.total_blocks, capacity.free_blocks);
        let dirs = [ObjectInfo::new("x/", 0, SystemTime::now(), "")];
        assert_eq!(Capacity::from_listing(&dirs).total_files, 100_000);
    }
}
