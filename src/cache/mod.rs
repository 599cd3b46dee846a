//! Caching layer: the shared key-value store and the response cache built on it.
//!
//! - [`store`]: the [`KeyValueStore`] abstraction, an in-process
//!   [`MemoryStore`], and the [`TimeoutStore`] deadline wrapper.
//! - [`key`]: deterministic cache-key derivation from path, query, caller,
//!   and language.
//! - [`middleware`]: [`ResponseCache`], the read-through GET cache.
//! - [`service`]: [`CacheService`] memoization and cache warming.
//! - [`stats`]: hit/miss counters.

pub mod key;
pub mod middleware;
pub mod service;
pub mod stats;
pub mod store;

pub use middleware::{CacheLookup, CacheTarget, CachedResponse, ResponseCache};
pub use service::{CacheService, WarmReport};
pub use stats::CacheStatsSnapshot;
pub use store::{KeyValueStore, MemoryStore, StoreError, StoreFuture, TimeoutStore};
