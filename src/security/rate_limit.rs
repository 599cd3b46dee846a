//! Per-caller, per-route admission control over a fixed counting window.
//!
//! Each request is charged to the bucket `rate_limit:{route}:{identity}` in
//! the shared [`KeyValueStore`]. The bucket's budget is the route's base limit
//! (exact pattern, then glob, then the default) scaled by the caller's tier:
//!
//! | Caller                         | Budget for a base of 60 |
//! |--------------------------------|-------------------------|
//! | anonymous                      | 60                      |
//! | authenticated                  | 60 × 2 = 120            |
//! | authenticated, active premium  | 60 × 2 × 5 = 600        |
//!
//! The counter is a plain get-then-put; two concurrent requests may both read
//! the same count and under-count by one. That is accepted.
//!
//! If the store is unreachable the limiter fails open: the request is allowed,
//! a warning is logged, and no counter write is attempted.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    Response, StatusCode,
    cache::KeyValueStore,
    config::{ConfigError, RateLimitConfig, WindowPolicy},
    context::{Caller, Context},
    middleware::{BoxResponseFuture, Middleware, Next},
    policy::RouteTable,
};

/// Quota figures reported to the caller in `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Effective budget for this caller on this route.
    pub limit: u32,
    pub remaining: u32,
    /// UNIX seconds at which the window is expected to reset.
    pub reset_at: u64,
}

impl Quota {
    /// Writes the three `X-RateLimit-*` headers onto `response`.
    pub fn apply(&self, response: &mut Response) {
        response.set_header("X-RateLimit-Limit", self.limit.to_string());
        response.set_header("X-RateLimit-Remaining", self.remaining.to_string());
        response.set_header("X-RateLimit-Reset", self.reset_at.to_string());
    }
}

/// Outcome of [`RateLimiter::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow(Quota),
    Reject { quota: Quota, retry_after: u64 },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }

    pub fn quota(&self) -> Quota {
        match self {
            Decision::Allow(quota) | Decision::Reject { quota, .. } => *quota,
        }
    }
}

#[derive(Serialize)]
struct RejectionBody {
    success: bool,
    message: &'static str,
    retry_after: u64,
}

/// Counter value as kept in the store.
///
/// Encoded as `"<count>"`, or `"<count>:<reset_at>"` when the window end is
/// preserved across writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Bucket {
    count: u32,
    reset_at: Option<u64>,
}

impl Bucket {
    fn decode(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?.trim();
        match text.split_once(':') {
            Some((count, reset_at)) => Some(Self {
                count: count.parse().ok()?,
                reset_at: Some(reset_at.parse().ok()?),
            }),
            None => Some(Self {
                count: text.parse().ok()?,
                reset_at: None,
            }),
        }
    }

    fn encode(&self) -> Bytes {
        match self.reset_at {
            Some(reset_at) => Bytes::from(format!("{}:{reset_at}", self.count)),
            None => Bytes::from(self.count.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct LimiterStats {
    allowed: AtomicU64,
    rejected: AtomicU64,
    store_errors: AtomicU64,
}

/// A point-in-time copy of the limiter's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStatsSnapshot {
    pub allowed: u64,
    pub rejected: u64,
    pub store_errors: u64,
}

/// Rate limiting middleware.
///
/// Cloning is cheap; clones share the store, the compiled route table, and the
/// statistics.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gatehouse::{cache::MemoryStore, config::RateLimitConfig, security::RateLimiter};
///
/// let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), &RateLimitConfig::default()).unwrap();
/// assert_eq!(limiter.base_limit("api/foo"), 60);
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    routes: Arc<RouteTable<u32>>,
    default_limit: u32,
    window: Duration,
    authenticated_multiplier: f64,
    premium_multiplier: f64,
    window_policy: WindowPolicy,
    trust_forwarded_for: bool,
    stats: Arc<LimiterStats>,
}

impl RateLimiter {
    /// Validates `config` and compiles its route table.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an out-of-range window or multiplier,
    /// [`ConfigError::InvalidPattern`] if a route glob cannot be compiled.
    pub fn new(store: Arc<dyn KeyValueStore>, config: &RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let routes = RouteTable::compile(
            config
                .routes
                .iter()
                .map(|rule| (rule.pattern.as_str(), rule.per_minute)),
        )?;

        Ok(Self {
            store,
            routes: Arc::new(routes),
            default_limit: config.default_limit,
            window: config.window(),
            authenticated_multiplier: config.authenticated_multiplier,
            premium_multiplier: config.premium_multiplier,
            window_policy: config.window_policy,
            trust_forwarded_for: config.trust_forwarded_for,
            stats: Arc::new(LimiterStats::default()),
        })
    }

    /// Base budget for a route before any caller multiplier.
    pub fn base_limit(&self, route: &str) -> u32 {
        self.routes.lookup(route).unwrap_or(self.default_limit)
    }

    /// Effective budget: base × authenticated multiplier × premium multiplier,
    /// floored.
    pub fn budget(&self, route: &str, caller: Option<&Caller>) -> u32 {
        let mut budget = f64::from(self.base_limit(route));
        if let Some(caller) = caller {
            budget *= self.authenticated_multiplier;
            if caller.is_premium() {
                budget *= self.premium_multiplier;
            }
        }
        // Float-to-int casts saturate, so an absurd multiplier caps at u32::MAX.
        budget.floor() as u32
    }

    /// Store key of the counter for `route` and `identity`.
    pub fn bucket_key(route: &str, identity: &impl std::fmt::Display) -> String {
        format!("rate_limit:{route}:{identity}")
    }

    /// Counts this request against its bucket and decides whether to admit it.
    ///
    /// Rejections only read the store; admissions read and write once.
    pub async fn evaluate(&self, ctx: &Context) -> Decision {
        let route = ctx.request().route_path();
        let identity = ctx.identity(self.trust_forwarded_for);
        let limit = self.budget(route, ctx.caller());
        let key = Self::bucket_key(route, &identity);
        let now = unix_now();
        let window_secs = self.window.as_secs();

        let mut bucket = match self.store.get(&key).await {
            Ok(raw) => raw.and_then(|raw| Bucket::decode(&raw)).unwrap_or_default(),
            Err(e) => {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                self.stats.allowed.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "rate limit store unavailable, allowing request");
                return Decision::Allow(Quota {
                    limit,
                    remaining: limit.saturating_sub(1),
                    reset_at: now.saturating_add(window_secs),
                });
            }
        };

        // The stored entry can outlive its window end by up to a second.
        if bucket.reset_at.is_some_and(|end| end <= now) {
            bucket = Bucket::default();
        }

        let reset_at = match self.window_policy {
            WindowPolicy::ResetOnWrite => now.saturating_add(window_secs),
            WindowPolicy::PreserveExpiry => bucket
                .reset_at
                .filter(|&end| end > now)
                .unwrap_or(now.saturating_add(window_secs)),
        };

        if bucket.count >= limit {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(%identity, route, limit, count = bucket.count, "rate limit exceeded");
            let retry_after = match self.window_policy {
                WindowPolicy::ResetOnWrite => window_secs,
                WindowPolicy::PreserveExpiry => reset_at.saturating_sub(now).max(1),
            };
            return Decision::Reject {
                quota: Quota {
                    limit,
                    remaining: 0,
                    reset_at,
                },
                retry_after,
            };
        }

        let (next, ttl) = match self.window_policy {
            WindowPolicy::ResetOnWrite => (
                Bucket {
                    count: bucket.count + 1,
                    reset_at: None,
                },
                self.window,
            ),
            WindowPolicy::PreserveExpiry => (
                Bucket {
                    count: bucket.count + 1,
                    reset_at: Some(reset_at),
                },
                Duration::from_secs(reset_at.saturating_sub(now).max(1)),
            ),
        };

        match self.store.put(&key, next.encode(), ttl).await {
            Ok(()) => {
                let rule = self.routes.classify(route).map_or("default", |(pattern, _)| pattern);
                debug!(%key, rule, count = next.count, limit, "request counted");
            }
            Err(e) => {
                self.stats.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%key, error = %e, "rate limit counter write failed");
            }
        }
        self.stats.allowed.fetch_add(1, Ordering::Relaxed);

        Decision::Allow(Quota {
            limit,
            remaining: limit.saturating_sub(bucket.count).saturating_sub(1),
            reset_at,
        })
    }

    /// Builds the `429` response for a rejected request.
    pub fn rejection(&self, quota: Quota, retry_after: u64) -> Response {
        let mut response = Response::json(
            StatusCode::TooManyRequests,
            &RejectionBody {
                success: false,
                message: "Rate limit exceeded. Please try again later.",
                retry_after,
            },
        );
        quota.apply(&mut response);
        response.set_header("Retry-After", retry_after.to_string());
        response
    }

    pub fn stats(&self) -> LimiterStatsSnapshot {
        LimiterStatsSnapshot {
            allowed: self.stats.allowed.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
            store_errors: self.stats.store_errors.load(Ordering::Relaxed),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl Middleware for RateLimiter {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        let limiter = self.clone();

        Box::pin(async move {
            match limiter.evaluate(&ctx).await {
                Decision::Reject { quota, retry_after } => limiter.rejection(quota, retry_after),
                Decision::Allow(quota) => {
                    let mut response = next.run(ctx).await;
                    quota.apply(&mut response);
                    response
                }
            }
        })
    }
}
