//! The shared key-value store both guard layers read and write.
//!
//! [`KeyValueStore`] is deliberately minimal: `get` and `put` with a TTL. The
//! backing service is treated as best-effort: callers must expect it to be
//! slow, empty, or unreachable at any time. [`TimeoutStore`] bounds every
//! operation so a stalled backend turns into a quick [`StoreError::Timeout`]
//! instead of a stalled request.

use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio::{sync::RwLock, time::Instant};

/// Failures reported by a [`KeyValueStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Get/put-with-TTL store shared by the rate limiter and the response cache.
///
/// No atomicity is promised beyond single-key reads and writes; a get-then-put
/// sequence may race with a concurrent one.
pub trait KeyValueStore: Send + Sync {
    /// Returns the live value for `key`, or `None` when absent or expired.
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>>;

    /// Stores `value` under `key` for `ttl`, replacing any previous value.
    fn put<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> StoreFuture<'a, ()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        (**self).get(key)
    }

    fn put<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> StoreFuture<'a, ()> {
        (**self).put(key, value, ttl)
    }
}

/// Expiry used when `now + ttl` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process store with per-entry expiry.
///
/// Expired entries are dropped lazily when read, or in bulk by
/// [`purge_expired`](Self::purge_expired).
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes every expired entry and returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }
}

impl KeyValueStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let now = Instant::now();
            {
                let entries = self.entries.read().await;
                match entries.get(key) {
                    Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
                    Some(_) => {}
                    None => return Ok(None),
                }
            }
            // Expired; re-check under the write lock in case a put raced in.
            let mut entries = self.entries.write().await;
            if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
                entries.remove(key);
            }
            Ok(None)
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = Instant::now();
            let entry = Entry {
                value,
                expires_at: now
                    .checked_add(ttl)
                    .unwrap_or_else(|| now + FAR_FUTURE),
            };
            self.entries.write().await.insert(key.to_owned(), entry);
            Ok(())
        })
    }
}

/// Wraps a store and fails any operation that exceeds a fixed deadline.
pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: KeyValueStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<S: KeyValueStore> KeyValueStore for TimeoutStore<S> {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.inner.get(key))
                .await
                .map_err(|_| StoreError::Timeout(self.timeout))?
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Bytes, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.inner.put(key, value, ttl))
                .await
                .map_err(|_| StoreError::Timeout(self.timeout))?
        })
    }
}
