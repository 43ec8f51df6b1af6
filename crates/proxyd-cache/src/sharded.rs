use crate::key::CacheKey;
use crate::traits::{CacheError, CacheStats, CachedEntry, ResponseCache};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of shards. Must be a power of two for fast modulo via bitmask.
const NUM_SHARDS: usize = 64;
const SHARD_MASK: u64 = (NUM_SHARDS as u64) - 1;

struct Slot {
    entry: Arc<CachedEntry>,
    /// `None` when the TTL is too large to represent as an `Instant`.
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// TTL in whole milliseconds, saturating at `u64::MAX`.
fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

type Shard = HashMap<CacheKey, Slot>;

/// Thread-safe sharded response store with a uniform TTL.
///
/// Keys are distributed across 64 independent shards, each behind its own
/// `RwLock`. Every key is owned by exactly one shard, so a `put` only
/// excludes readers of that shard and never blocks lookups of keys that
/// hash elsewhere:
///
/// - **hit**: `read lock` on one shard → clone the `Arc` → release.
/// - **put**: `write lock` on one shard → insert → release.
/// - **expired read**: the read lock is released first, then a `write lock`
///   removes the slot if it is still the expired one.
///
/// Expiry is time-driven. A slot records its deadline at insert time and
/// reads never extend it. Lookups treat a passed deadline as absent, and
/// [`ShardedStore::purge_expired`] drops dead slots in bulk so entries that
/// are never read again do not linger.
pub struct ShardedStore {
    shards: Box<[RwLock<Shard>]>,
    hasher: ahash::RandomState,
    ttl_millis: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    expirations: AtomicU64,
}

impl ShardedStore {
    pub fn new(ttl: Duration) -> Self {
        let shards: Vec<RwLock<Shard>> = (0..NUM_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        tracing::info!(
            shards = NUM_SHARDS,
            ttl_ms = millis(ttl),
            "response store initialized"
        );

        Self {
            shards: shards.into_boxed_slice(),
            hasher: ahash::RandomState::new(),
            ttl_millis: AtomicU64::new(millis(ttl)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Hash a key and return its shard.
    #[inline]
    fn shard(&self, key: &CacheKey) -> &RwLock<Shard> {
        let hash = self.hasher.hash_one(key);
        &self.shards[(hash & SHARD_MASK) as usize]
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis.load(Ordering::Relaxed))
    }

    /// Total number of slots across all shards, including expired ones
    /// that have not been purged yet.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    fn evict_if_expired(&self, key: &CacheKey) {
        let mut shard = self.shard(key).write();
        // A concurrent put may have replaced the slot since the read lock
        // was dropped; only remove it if it is still dead.
        let dead = shard
            .get(key)
            .is_some_and(|slot| !slot.is_live(Instant::now()));
        if dead {
            shard.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl ResponseCache for ShardedStore {
    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>> {
        let found = {
            let shard = self.shard(key).read();
            shard.get(key).map(|slot| {
                if slot.is_live(Instant::now()) {
                    Some(Arc::clone(&slot.entry))
                } else {
                    None
                }
            })
        };

        match found {
            Some(Some(entry)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.evict_if_expired(key);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: CacheKey, entry: CachedEntry) -> Result<(), CacheError> {
        let ttl = self.ttl();
        if ttl.is_zero() {
            tracing::debug!(key = %key, "ttl is zero, caching disabled");
            return Ok(());
        }

        let slot = Slot {
            entry: Arc::new(entry),
            expires_at: Instant::now().checked_add(ttl),
        };

        let mut shard = self.shard(&key).write();
        shard.try_reserve(1).map_err(|source| CacheError::Reserve {
            key: key.to_string(),
            source,
        })?;
        shard.insert(key, slot);
        drop(shard);

        self.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            let before = shard.len();
            shard.retain(|_, slot| slot.is_live(now));
            removed += before - shard.len();
        }
        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn set_ttl(&self, ttl: Duration) {
        self.ttl_millis
            .store(millis(ttl), Ordering::Relaxed);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            current_size: self.len(),
            ttl_seconds: self.ttl().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::CONTENT_TYPE;
    use http::{HeaderMap, HeaderValue};
    use std::thread;

    fn entry(body: &'static str) -> CachedEntry {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        CachedEntry::new(Bytes::from_static(body.as_bytes()), headers)
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::new(s, None)
    }

    #[test]
    fn huge_ttl_saturates() {
        let store = ShardedStore::new(Duration::MAX);
        assert_eq!(store.ttl(), Duration::from_millis(u64::MAX));

        store.put(key("/forever"), entry("x")).unwrap();
        assert!(store.get(&key("/forever")).is_some());
        assert_eq!(store.purge_expired(), 0);

        store.set_ttl(Duration::from_secs(u64::MAX));
        assert_eq!(store.ttl(), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn put_then_get() {
        let store = ShardedStore::new(Duration::from_secs(60));

        store.put(key("/hello"), entry("world")).unwrap();
        let got = store.get(&key("/hello")).expect("entry should be live");
        assert_eq!(got.body, Bytes::from_static(b"world"));
        assert_eq!(got.headers[CONTENT_TYPE], "application/json");
        assert!(store.get(&key("/missing")).is_none());
    }

    #[test]
    fn overwrite_never_returns_older_entry() {
        let store = ShardedStore::new(Duration::from_secs(60));

        store.put(key("/k"), entry("first")).unwrap();
        let old = store.get(&key("/k")).unwrap();
        store.put(key("/k"), entry("second")).unwrap();

        assert_eq!(store.get(&key("/k")).unwrap().body, "second");
        // The previously handed-out entry is untouched.
        assert_eq!(old.body, "first");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn entry_expires_after_ttl() {
        let store = ShardedStore::new(Duration::from_millis(40));

        store.put(key("/short"), entry("x")).unwrap();
        assert!(store.get(&key("/short")).is_some());

        thread::sleep(Duration::from_millis(80));
        assert!(store.get(&key("/short")).is_none());
        // The expired read evicted the slot.
        assert_eq!(store.len(), 0);
        assert_eq!(store.stats().expirations, 1);
    }

    #[test]
    fn reads_do_not_extend_lifetime() {
        let store = ShardedStore::new(Duration::from_millis(200));
        store.put(key("/busy"), entry("x")).unwrap();

        for _ in 0..4 {
            thread::sleep(Duration::from_millis(10));
            assert!(store.get(&key("/busy")).is_some());
        }
        thread::sleep(Duration::from_millis(200));
        assert!(store.get(&key("/busy")).is_none());
    }

    #[test]
    fn put_after_expiry_revives_key() {
        let store = ShardedStore::new(Duration::from_millis(20));
        store.put(key("/k"), entry("old")).unwrap();
        thread::sleep(Duration::from_millis(40));
        assert!(store.get(&key("/k")).is_none());

        store.put(key("/k"), entry("new")).unwrap();
        assert_eq!(store.get(&key("/k")).unwrap().body, "new");
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let store = ShardedStore::new(Duration::ZERO);

        store.put(key("/k"), entry("x")).unwrap();
        assert!(store.get(&key("/k")).is_none());
        assert!(store.is_empty());
        assert_eq!(store.stats().stores, 0);
    }

    #[test]
    fn set_ttl_applies_to_later_puts() {
        let store = ShardedStore::new(Duration::from_millis(20));
        store.set_ttl(Duration::from_secs(60));
        store.put(key("/k"), entry("x")).unwrap();

        thread::sleep(Duration::from_millis(40));
        assert!(store.get(&key("/k")).is_some());
        assert_eq!(store.stats().ttl_seconds, 60);
    }

    #[test]
    fn purge_removes_only_dead_slots() {
        let store = ShardedStore::new(Duration::from_millis(20));
        for i in 0..50 {
            store.put(key(&format!("/old/{i}")), entry("x")).unwrap();
        }
        thread::sleep(Duration::from_millis(40));

        store.set_ttl(Duration::from_secs(60));
        for i in 0..10 {
            store.put(key(&format!("/new/{i}")), entry("y")).unwrap();
        }

        assert_eq!(store.len(), 60);
        assert_eq!(store.purge_expired(), 50);
        assert_eq!(store.len(), 10);
        assert_eq!(store.purge_expired(), 0);
    }

    #[test]
    fn lookup_derives_key_from_uri() {
        let store = ShardedStore::new(Duration::from_secs(60));
        store
            .put(CacheKey::new("/coins", Some("b=2&a=1")), entry("x"))
            .unwrap();

        let uri: http::Uri = "/coins?a=1&b=2".parse().unwrap();
        assert!(store.lookup(&uri).is_some());
    }

    #[test]
    fn distributes_across_shards() {
        let store = ShardedStore::new(Duration::from_secs(60));

        for i in 0..200 {
            store.put(key(&format!("/key-{i}")), entry("x")).unwrap();
        }

        assert_eq!(store.len(), 200);

        let nonempty_shards = store
            .shards
            .iter()
            .filter(|s| !s.read().is_empty())
            .count();
        assert!(
            nonempty_shards > 1,
            "expected keys distributed across multiple shards, got {}",
            nonempty_shards
        );
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let store = ShardedStore::new(Duration::from_secs(60));

        store.put(key("/a"), entry("x")).unwrap();
        store.put(key("/b"), entry("x")).unwrap();
        store.get(&key("/a")); // hit
        store.get(&key("/z")); // miss

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 2);
        assert_eq!(stats.current_size, 2);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn concurrent_access() {
        let store = Arc::new(ShardedStore::new(Duration::from_secs(60)));

        for i in 0..1000 {
            store.put(key(&format!("/key-{i}")), entry("x")).unwrap();
        }

        let mut handles = vec![];

        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    let k = key(&format!("/key-{}", (t * 1000 + i) % 2000));
                    if i % 3 == 0 {
                        store.put(k, entry("y")).unwrap();
                    } else {
                        store.get(&k);
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert!(store.len() <= 2000);
        let stats = store.stats();
        assert!(stats.hits + stats.misses > 0);
    }

    #[test]
    fn is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ShardedStore>();
        assert_send_sync::<Arc<dyn ResponseCache>>();
    }
}
