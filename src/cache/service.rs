//! Application-level helpers on top of the shared store.
//!
//! - [`CacheService`] memoizes computed values (upstream API lookups,
//!   aggregates) as JSON under a namespaced key.
//! - [`ResponseCache::warm`] pre-populates the response cache for a list of
//!   anonymous GET paths, e.g. at deploy time.

use std::{future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use super::{
    middleware::{CacheTarget, ResponseCache},
    store::{KeyValueStore, StoreError},
};
use crate::{Method, Request, context::Context, middleware::Handler};

/// Typed read-through cache over a [`KeyValueStore`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::{sync::Arc, time::Duration};
/// use gatehouse::cache::{CacheService, MemoryStore};
///
/// # async fn example() {
/// let service = CacheService::new(Arc::new(MemoryStore::new()), "app_cache");
/// let brands: Vec<String> = service
///     .remember("popular_brands", Duration::from_secs(3600), || async {
///         vec!["Toyota".to_owned(), "Ford".to_owned()]
///     })
///     .await;
/// # }
/// ```
#[derive(Clone)]
pub struct CacheService {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl CacheService {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    /// Reads and decodes a JSON value.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let Some(raw) = self.store.get(&self.key(key)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Codec(e.to_string()))
    }

    /// Encodes and writes a JSON value.
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(value).map_err(|e| StoreError::Codec(e.to_string()))?;
        self.store.put(&self.key(key), Bytes::from(encoded), ttl).await
    }

    /// Returns the cached value for `key`, or runs `producer`, caches its
    /// output for `ttl`, and returns it.
    ///
    /// Store failures are logged and never prevent `producer` from running.
    pub async fn remember<T, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self
            .try_remember(key, ttl, move || async move {
                Ok::<_, std::convert::Infallible>(producer().await)
            })
            .await
        {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Like [`remember`](Self::remember) for fallible producers. Errors are
    /// returned to the caller and nothing is cached.
    pub async fn try_remember<T, E, F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.get_json::<T>(key).await {
            Ok(Some(value)) => {
                debug!(key, "remembered value hit");
                return Ok(value);
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "remembered value unreadable, recomputing"),
        }

        let value = producer().await?;
        if let Err(e) = self.put_json(key, &value, ttl).await {
            warn!(key, error = %e, "failed to cache remembered value");
        }
        Ok(value)
    }
}

/// Outcome of [`ResponseCache::warm`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    /// Paths fetched and stored.
    pub warmed: usize,
    /// Paths already present in the cache.
    pub already_cached: usize,
    /// Paths that are not cacheable for anonymous GETs.
    pub skipped: usize,
    /// Paths whose handler did not return `200` or whose store access failed.
    pub failed: usize,
}

impl ResponseCache {
    /// Pre-populates the cache for anonymous, language-neutral GETs of `paths`.
    ///
    /// Each path may carry a query string. The handler is only called for
    /// paths that are cacheable and not already stored.
    pub async fn warm<I, S>(&self, paths: I, endpoint: &Handler) -> WarmReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = WarmReport::default();

        for path in paths {
            let path = path.as_ref();
            let ctx = Context::new(Request::new(Method::Get, path));

            let Some(ttl) = self.ttl_for(ctx.request().route_path()) else {
                report.skipped += 1;
                continue;
            };
            let target = CacheTarget {
                key: self.key_for(&ctx),
                ttl,
            };

            match self.backing_store().get(&target.key).await {
                Ok(Some(_)) => {
                    report.already_cached += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path, error = %e, "cache warm lookup failed");
                    report.failed += 1;
                    continue;
                }
            }

            let response = endpoint(ctx).await;
            match self.store(&target, &response).await {
                Ok(true) => report.warmed += 1,
                Ok(false) => {
                    warn!(path, status = response.status().as_u16(), "cache warm got non-200");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(path, error = %e, "cache warm write failed");
                    report.failed += 1;
                }
            }
        }

        debug!(?report, "cache warm finished");
        report
    }
}
