//! Guard configuration: route policy tables, multipliers, and store limits.
//!
//! All settings deserialize from JSON with `#[serde(default)]`, so a file only
//! needs the keys it overrides:
//!
//! ```json
//! {
//!   "rate_limit": {
//!     "default_limit": 100,
//!     "routes": [{ "pattern": "api/auth/login", "per_minute": 5 }]
//!   },
//!   "cache": {
//!     "routes": [{ "pattern": "api/car-brands/*", "ttl_secs": 3600 }]
//!   },
//!   "store": { "op_timeout_ms": 40 }
//! }
//! ```
//!
//! The [`Default`] values carry the platform's production tables.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or compiling configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid route pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level configuration for both guard layers and their shared store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub store: StoreConfig,
}

impl GuardConfig {
    /// Parses a JSON document; missing keys take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.rate_limit.validate()?;
        self.cache.validate()
    }
}

/// Longest accepted rate-limit window or cache TTL: 365 days.
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

fn check_ttl(field: &'static str, secs: u64) -> Result<(), ConfigError> {
    if secs > MAX_TTL_SECS {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{secs}s exceeds the {MAX_TTL_SECS}s maximum"),
        });
    }
    Ok(())
}

/// How the rate-limit counter's expiry behaves across writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Every counted request rewrites the counter with a fresh full-window TTL.
    /// A caller who never pauses for a whole window never gets a reset.
    #[default]
    ResetOnWrite,
    /// The window ends a fixed time after its first request; later writes keep
    /// that end time.
    PreserveExpiry,
}

/// One `pattern → requests per minute` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    pub pattern: String,
    pub per_minute: u32,
}

impl RateRule {
    pub fn new(pattern: impl Into<String>, per_minute: u32) -> Self {
        Self {
            pattern: pattern.into(),
            per_minute,
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Budget for routes no rule matches.
    pub default_limit: u32,
    pub window_secs: u64,
    pub authenticated_multiplier: f64,
    /// Stacks on top of the authenticated multiplier.
    pub premium_multiplier: f64,
    pub window_policy: WindowPolicy,
    /// Use the first `X-Forwarded-For` hop as the client address.
    pub trust_forwarded_for: bool,
    /// Ordered; exact patterns are consulted before globs.
    pub routes: Vec<RateRule>,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Checks the window length and multipliers.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit.window_secs",
                reason: "must be at least 1".into(),
            });
        }
        check_ttl("rate_limit.window_secs", self.window_secs)?;
        for (field, value) in [
            (
                "rate_limit.authenticated_multiplier",
                self.authenticated_multiplier,
            ),
            ("rate_limit.premium_multiplier", self.premium_multiplier),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("expected a non-negative number, got {value}"),
                });
            }
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 60,
            window_secs: 60,
            authenticated_multiplier: 2.0,
            premium_multiplier: 5.0,
            window_policy: WindowPolicy::ResetOnWrite,
            trust_forwarded_for: false,
            routes: vec![
                RateRule::new("api/auth/login", 5),
                RateRule::new("api/auth/register", 3),
                RateRule::new("api/auth/forgot-password", 3),
                RateRule::new("api/diagnosis/start", 10),
                RateRule::new("api/diagnosis/*", 30),
                RateRule::new("api/ai/*", 20),
                RateRule::new("api/parts/search", 30),
                RateRule::new("api/payments/*", 10),
                RateRule::new("api/car-brands*", 120),
                RateRule::new("api/car-models*", 120),
            ],
        }
    }
}

/// One `pattern → TTL` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    pub pattern: String,
    pub ttl_secs: u64,
}

impl CacheRule {
    pub fn new(pattern: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            pattern: pattern.into(),
            ttl_secs,
        }
    }
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub key_prefix: String,
    /// Ordered; exact patterns are consulted before globs.
    pub routes: Vec<CacheRule>,
    /// Plain path prefixes that are never cached, checked before `routes`.
    pub non_cacheable_prefixes: Vec<String>,
    /// The only response headers persisted with a cached entry.
    pub persisted_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "api_cache".into(),
            routes: vec![
                CacheRule::new("api/car-brands", 3_600),
                CacheRule::new("api/car-brands/popular", 86_400),
                CacheRule::new("api/car-brands/*", 3_600),
                CacheRule::new("api/car-models/*", 3_600),
                CacheRule::new("api/car-years/*", 86_400),
                CacheRule::new("api/parts/categories", 86_400),
                CacheRule::new("api/parts/*", 1_800),
                CacheRule::new("api/diagnosis/symptoms", 3_600),
                CacheRule::new("api/diagnosis/common-issues", 7_200),
                CacheRule::new("api/subscription-plans", 3_600),
            ],
            non_cacheable_prefixes: [
                "api/auth",
                "api/login",
                "api/logout",
                "api/register",
                "api/diagnosis/start",
                "api/user",
                "api/my-vehicles",
                "api/my-diagnoses",
                "api/orders",
                "api/payments",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            persisted_headers: [
                "Content-Type",
                "Content-Language",
                "X-Total-Count",
                "X-Per-Page",
                "X-Current-Page",
                "X-Last-Page",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl CacheConfig {
    /// Checks every route TTL.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if a TTL exceeds [`MAX_TTL_SECS`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.routes
            .iter()
            .try_for_each(|rule| check_ttl("cache.routes.ttl_secs", rule.ttl_secs))
    }
}

/// Shared key-value store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on any single get/put before it counts as a failure.
    pub op_timeout_ms: u64,
}

impl StoreConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { op_timeout_ms: 50 }
    }
}
