use crate::key::CacheKey;
use bytes::Bytes;
use http::{HeaderMap, Uri};
use std::collections::TryReserveError;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A captured upstream response. Immutable once built: replacing a key
/// installs a new `Arc<CachedEntry>` rather than touching the old one, so a
/// reader holding the previous entry never sees a torn body/header pair.
#[derive(Clone, Debug)]
pub struct CachedEntry {
    pub body: Bytes,
    pub headers: HeaderMap,
    pub captured_at: Instant,
}

impl CachedEntry {
    pub fn new(body: Bytes, headers: HeaderMap) -> Self {
        Self {
            body,
            headers,
            captured_at: Instant::now(),
        }
    }

    /// Time since the upstream response was captured.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

/// Snapshot of store statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub expirations: u64,
    pub current_size: usize,
    pub ttl_seconds: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to reserve space for cache key {key}")]
    Reserve {
        key: String,
        #[source]
        source: TryReserveError,
    },
}

/// Read-through/write-through response store shared by every request task.
///
/// Implementations must be safe to call from any number of tasks at once and
/// must never hold a lock across I/O.
pub trait ResponseCache: Send + Sync {
    /// Look up a live entry. Expired entries are reported as absent.
    fn get(&self, key: &CacheKey) -> Option<Arc<CachedEntry>>;

    /// Insert or replace the entry for `key`, expiring it one TTL from now.
    fn put(&self, key: CacheKey, entry: CachedEntry) -> Result<(), CacheError>;

    /// Physically remove every expired entry. Returns how many were dropped.
    fn purge_expired(&self) -> usize;

    /// Change the TTL applied to subsequent `put`s.
    fn set_ttl(&self, ttl: Duration);

    fn stats(&self) -> CacheStats;

    /// Derive the key from a request URI and look it up.
    fn lookup(&self, uri: &Uri) -> Option<Arc<CachedEntry>> {
        self.get(&CacheKey::from_uri(uri))
    }
}
