//! Read-through response cache for idempotent GET endpoints.
//!
//! [`ResponseCache`] classifies each request against the non-cacheable
//! prefixes and the cacheable-routes table, derives a key with
//! [`cache_key`](super::key::cache_key), and either replays a stored response
//! or lets the request through and stores a fresh `200` on the way back.
//!
//! Caching is strictly best-effort: a store that errors or times out turns the
//! layer into a pass-through for that request.

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    key::cache_key,
    stats::{CacheStats, CacheStatsSnapshot},
    store::{KeyValueStore, StoreError},
};
use crate::{
    Method, Response, StatusCode,
    config::{CacheConfig, ConfigError},
    context::Context,
    middleware::{BoxResponseFuture, Middleware, Next},
    policy::RouteTable,
};

/// A response as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    #[serde(with = "content_base64")]
    pub content: Vec<u8>,
    pub status: u16,
    /// Whitelisted headers only.
    pub headers: BTreeMap<String, String>,
    /// UNIX seconds at which the entry was written.
    pub cached_at: u64,
}

impl CachedResponse {
    /// Rebuilds a response, or `None` if the stored status is not one we model.
    fn into_response(self) -> Option<Response> {
        let status = StatusCode::from_u16(self.status)?;
        let mut response = Response::new(status).body_bytes(self.content);
        for (name, value) in self.headers {
            response.add_header(name, value);
        }
        Some(response)
    }
}

mod content_base64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(content))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Where and for how long a cacheable request's response is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTarget {
    pub key: String,
    pub ttl: Duration,
}

/// Outcome of [`ResponseCache::evaluate`].
#[derive(Debug)]
pub enum CacheLookup {
    /// Not a cacheable request, or the store could not be read.
    Bypass,
    /// A stored response, already tagged with `X-Cache: HIT`.
    Hit(Response),
    /// Cacheable but not stored yet.
    Miss(CacheTarget),
}

/// Response caching middleware.
///
/// Cloning is cheap; clones share the store, the compiled tables, and the
/// statistics.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    routes: Arc<RouteTable<u64>>,
    non_cacheable: Arc<[String]>,
    persisted_headers: Arc<[String]>,
    prefix: Arc<str>,
    stats: Arc<CacheStats>,
}

impl ResponseCache {
    /// Validates `config` and compiles its tables.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a TTL is out of range,
    /// [`ConfigError::InvalidPattern`] if a route glob cannot be compiled.
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let routes = RouteTable::compile(
            config
                .routes
                .iter()
                .map(|rule| (rule.pattern.as_str(), rule.ttl_secs)),
        )?;
        let non_cacheable: Vec<String> = config
            .non_cacheable_prefixes
            .iter()
            .map(|prefix| prefix.trim_start_matches('/').to_owned())
            .collect();

        Ok(Self {
            store,
            routes: Arc::new(routes),
            non_cacheable: Arc::from(non_cacheable),
            persisted_headers: Arc::from(config.persisted_headers.clone()),
            prefix: Arc::from(config.key_prefix.as_str()),
            stats: Arc::new(CacheStats::default()),
        })
    }

    /// `true` if `route` starts with any never-cache prefix.
    pub fn is_non_cacheable(&self, route: &str) -> bool {
        let route = route.trim_start_matches('/');
        self.non_cacheable
            .iter()
            .any(|prefix| route.starts_with(prefix.as_str()))
    }

    /// TTL for a path, ignoring the method. Non-cacheable prefixes win over
    /// the routes table.
    pub fn ttl_for(&self, route: &str) -> Option<Duration> {
        if self.is_non_cacheable(route) {
            return None;
        }
        self.routes.lookup(route).map(Duration::from_secs)
    }

    /// The cache key this request maps to.
    pub fn key_for(&self, ctx: &Context) -> String {
        cache_key(&self.prefix, ctx)
    }

    /// Classifies the request and, if cacheable, looks it up.
    pub async fn evaluate(&self, ctx: &Context) -> CacheLookup {
        if ctx.request().method() != &Method::Get {
            return CacheLookup::Bypass;
        }
        let Some(ttl) = self.ttl_for(ctx.request().route_path()) else {
            return CacheLookup::Bypass;
        };

        let target = CacheTarget {
            key: self.key_for(ctx),
            ttl,
        };

        match self.store.get(&target.key).await {
            Ok(Some(raw)) => match decode_entry(&raw) {
                Some(mut response) => {
                    self.stats.record_hit();
                    debug!(key = %target.key, "cache hit");
                    response.set_header("X-Cache", "HIT");
                    response.set_header("X-Cache-Key", target.key.as_str());
                    CacheLookup::Hit(response)
                }
                None => {
                    warn!(key = %target.key, "discarding undecodable cache entry");
                    self.stats.record_miss();
                    CacheLookup::Miss(target)
                }
            },
            Ok(None) => {
                self.stats.record_miss();
                debug!(key = %target.key, "cache miss");
                CacheLookup::Miss(target)
            }
            Err(e) => {
                self.stats.record_error();
                warn!(key = %target.key, error = %e, "cache read failed, passing through");
                CacheLookup::Bypass
            }
        }
    }

    /// Persists `response` at `target` if its status is exactly `200`.
    ///
    /// Returns whether anything was written.
    pub async fn store(&self, target: &CacheTarget, response: &Response) -> Result<bool, StoreError> {
        if response.status() != StatusCode::Ok {
            self.stats.record_skip();
            return Ok(false);
        }

        let entry = CachedResponse {
            content: response.content().to_vec(),
            status: response.status().as_u16(),
            headers: self.persisted(response),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
        };
        let encoded = serde_json::to_vec(&entry).map_err(|e| StoreError::Codec(e.to_string()))?;

        match self.store.put(&target.key, Bytes::from(encoded), target.ttl).await {
            Ok(()) => {
                self.stats.record_store();
                debug!(key = %target.key, ttl = ?target.ttl, "response cached");
                Ok(true)
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    /// Point-in-time copy of the hit/miss counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn backing_store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    fn persisted(&self, response: &Response) -> BTreeMap<String, String> {
        response
            .headers()
            .iter()
            .filter(|(name, _)| {
                self.persisted_headers
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(name))
            })
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect()
    }
}

fn decode_entry(raw: &[u8]) -> Option<Response> {
    serde_json::from_slice::<CachedResponse>(raw)
        .ok()?
        .into_response()
}

impl Middleware for ResponseCache {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let cache = self.clone();

        Box::pin(async move {
            match cache.evaluate(&ctx).await {
                CacheLookup::Bypass => next.run(ctx).await,
                CacheLookup::Hit(response) => response,
                CacheLookup::Miss(target) => {
                    let mut response = next.run(ctx).await;
                    match cache.store(&target, &response).await {
                        Ok(_) => {
                            response.set_header("X-Cache", "MISS");
                            response.set_header("X-Cache-Key", target.key);
                        }
                        Err(e) => {
                            warn!(key = %target.key, error = %e, "cache write failed");
                        }
                    }
                    response
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MemoryStore,
        config::CacheRule,
        middleware::Pipeline,
        test_support::{
            CountingEndpoint, FailingStore, WriteFailingStore, anonymous, get, request, user,
        },
    };

    fn cache_with(store: Arc<dyn KeyValueStore>) -> ResponseCache {
        ResponseCache::new(store, &CacheConfig::default()).unwrap()
    }

    fn pipeline(cache: &ResponseCache, endpoint: &CountingEndpoint) -> Pipeline {
        let handler = endpoint.handler();
        Pipeline::new(move |ctx: Context| handler(ctx)).layer(cache.clone())
    }

    #[test]
    fn oversized_ttl_is_rejected_at_construction() {
        let config = CacheConfig {
            routes: vec![CacheRule::new("api/forever", u64::MAX)],
            ..CacheConfig::default()
        };
        let err = ResponseCache::new(Arc::new(MemoryStore::new()), &config).err();
        assert!(matches!(err, Some(ConfigError::Invalid { .. })));
    }

    #[tokio::test]
    async fn miss_then_hit_share_key() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        let first = pipeline.handle(anonymous(get("/api/car-brands/popular"))).await;
        let second = pipeline.handle(anonymous(get("/api/car-brands/popular"))).await;

        assert_eq!(first.headers().get("X-Cache"), Some("MISS"));
        assert_eq!(second.headers().get("X-Cache"), Some("HIT"));
        assert_eq!(
            first.headers().get("X-Cache-Key"),
            second.headers().get("X-Cache-Key")
        );
        assert_eq!(second.content(), first.content());
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn hit_never_invokes_handler() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        pipeline.handle(anonymous(get("/api/parts/categories"))).await;
        for _ in 0..5 {
            let resp = pipeline.handle(anonymous(get("/api/parts/categories"))).await;
            assert_eq!(resp.headers().get("X-Cache"), Some("HIT"));
        }
        assert_eq!(endpoint.calls(), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.stores), (5, 1, 1));
    }

    #[tokio::test]
    async fn hit_replays_only_whitelisted_headers() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        pipeline.handle(anonymous(get("/api/car-models/3"))).await;
        let hit = pipeline.handle(anonymous(get("/api/car-models/3"))).await;

        assert_eq!(hit.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(hit.headers().get("X-Total-Count"), Some("42"));
        assert!(!hit.headers().contains("Set-Cookie"));
    }

    #[tokio::test]
    async fn only_200_is_stored() {
        for status in [StatusCode::NotFound, StatusCode::InternalServerError] {
            let store = Arc::new(MemoryStore::new());
            let cache = cache_with(store.clone());
            let endpoint = CountingEndpoint::new(status);
            let pipeline = pipeline(&cache, &endpoint);

            let first = pipeline.handle(anonymous(get("/api/car-brands"))).await;
            pipeline.handle(anonymous(get("/api/car-brands"))).await;

            assert_eq!(first.status(), status);
            assert_eq!(first.headers().get("X-Cache"), Some("MISS"));
            assert!(first.headers().contains("X-Cache-Key"));
            assert_eq!(endpoint.calls(), 2);
            assert!(store.is_empty().await);
            assert_eq!(cache.stats().skipped, 2);
        }
    }

    #[tokio::test]
    async fn non_get_methods_bypass() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        for method in [Method::Post, Method::Put, Method::Delete] {
            let resp = pipeline
                .handle(anonymous(request(method, "/api/car-brands/popular")))
                .await;
            assert!(!resp.headers().contains("X-Cache"));
            assert!(!resp.headers().contains("X-Cache-Key"));
        }
        assert_eq!(endpoint.calls(), 3);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn non_cacheable_prefix_beats_matching_glob() {
        let config = CacheConfig {
            routes: vec![CacheRule::new("api/*", 600)],
            ..CacheConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), &config).unwrap();
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        assert_eq!(cache.ttl_for("api/user/profile"), None);
        assert_eq!(cache.ttl_for("api/anything-else"), Some(Duration::from_secs(600)));

        pipeline.handle(user(get("/api/user/profile"), "5")).await;
        pipeline.handle(user(get("/api/user/profile"), "5")).await;
        assert_eq!(endpoint.calls(), 2);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn unmatched_route_is_not_cached() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let lookup = cache.evaluate(&anonymous(get("/api/foo"))).await;
        assert!(matches!(lookup, CacheLookup::Bypass));
    }

    #[tokio::test]
    async fn exact_ttl_beats_glob_ttl() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let lookup = cache.evaluate(&anonymous(get("/api/car-brands/popular"))).await;
        match lookup {
            CacheLookup::Miss(target) => assert_eq!(target.ttl, Duration::from_secs(86_400)),
            other => panic!("expected miss, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn users_do_not_share_entries() {
        let cache = cache_with(Arc::new(MemoryStore::new()));
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        pipeline.handle(user(get("/api/parts/brakes"), "1")).await;
        let other = pipeline.handle(user(get("/api/parts/brakes"), "2")).await;
        assert_eq!(other.headers().get("X-Cache"), Some("MISS"));
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn read_failure_passes_through_untouched() {
        let cache = cache_with(Arc::new(FailingStore));
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        let resp = pipeline.handle(anonymous(get("/api/car-brands/popular"))).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(resp.content(), b"200 #1");
        assert!(!resp.headers().contains("X-Cache"));
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn write_failure_returns_live_response() {
        let cache = cache_with(Arc::new(WriteFailingStore));
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        let resp = pipeline.handle(anonymous(get("/api/car-brands/popular"))).await;
        assert_eq!(resp.status(), StatusCode::Ok);
        assert_eq!(resp.content(), b"200 #1");
        assert!(!resp.headers().contains("X-Cache"));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn corrupt_entry_is_treated_as_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with(store.clone());
        store
            .put(
                "api_cache:api/car-brands/popular",
                Bytes::from_static(b"not json"),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        let resp = pipeline.handle(anonymous(get("/api/car-brands/popular"))).await;
        assert_eq!(resp.headers().get("X-Cache"), Some("MISS"));
        let again = pipeline.handle(anonymous(get("/api/car-brands/popular"))).await;
        assert_eq!(again.headers().get("X-Cache"), Some("HIT"));
    }

    #[tokio::test]
    async fn entry_expires_with_ttl() {
        let config = CacheConfig {
            routes: vec![CacheRule::new("api/car-brands", 1)],
            ..CacheConfig::default()
        };
        let cache = ResponseCache::new(Arc::new(MemoryStore::new()), &config).unwrap();
        let endpoint = CountingEndpoint::new(StatusCode::Ok);
        let pipeline = pipeline(&cache, &endpoint);

        pipeline.handle(anonymous(get("/api/car-brands"))).await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let resp = pipeline.handle(anonymous(get("/api/car-brands"))).await;
        assert_eq!(resp.headers().get("X-Cache"), Some("MISS"));
        assert_eq!(endpoint.calls(), 2);
    }

    #[test]
    fn stored_entry_is_json_with_base64_content() {
        let entry = CachedResponse {
            content: b"{\"brands\":[]}".to_vec(),
            status: 200,
            headers: BTreeMap::from([("Content-Type".into(), "application/json".into())]),
            cached_at: 1_700_000_000,
        };
        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["content"], "eyJicmFuZHMiOltdfQ==");
        assert_eq!(json["status"], 200);
        assert_eq!(json["headers"]["Content-Type"], "application/json");
        assert_eq!(json["cached_at"], 1_700_000_000u64);
    }
}
