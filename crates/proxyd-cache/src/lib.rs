//! In-memory response store for the caching proxy.
//!
//! [`ShardedStore`] holds captured upstream responses under a canonical
//! [`CacheKey`] for a uniform TTL. The proxy talks to it through the
//! [`ResponseCache`] trait so tests can substitute their own store.

pub mod key;
pub mod sharded;
pub mod traits;

pub use key::CacheKey;
pub use sharded::ShardedStore;
pub use traits::{CacheError, CacheStats, CachedEntry, ResponseCache};
