//! Per-request context: the request plus state injected by earlier layers.
//!
//! The authentication layer (outside this crate) resolves who is calling and
//! attaches a [`Caller`] to the [`Extensions`] map. The guard middleware reads
//! it back through [`Context::caller`] to derive a [`CallerIdentity`] and the
//! subscription tier.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::Request;

/// Type-erased request extensions map: used to inject per-request state
/// into handlers without requiring handlers to know about each other's types.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    /// Create a new empty extensions map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the extensions map
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Get a value from the extensions map
    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }
}

/// Lifecycle state of a paid subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Cancelled,
    Expired,
}

/// A paid subscription as reported by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub status: SubscriptionStatus,
    /// UNIX seconds after which the subscription lapses; `None` never lapses.
    pub expires_at: Option<u64>,
}

impl Subscription {
    /// `true` when the subscription is `Active` and not past its expiry at `now`.
    pub fn is_active_at(&self, now: u64) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at.is_none_or(|end| end > now)
    }
}

/// An authenticated caller, attached to the context by the auth layer.
///
/// Anonymous requests carry no `Caller` at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub subscription: Option<Subscription>,
}

impl Caller {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            subscription: None,
        }
    }

    #[must_use]
    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// `true` if the caller holds a paid subscription that is active right now.
    pub fn is_premium(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        self.subscription
            .as_ref()
            .is_some_and(|sub| sub.is_active_at(now))
    }
}

/// The bucket/key discriminator for a request.
///
/// Renders as `user:<id>` or `ip:<address>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallerIdentity {
    User(String),
    Ip(String),
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Ip(addr) => write!(f, "ip:{addr}"),
        }
    }
}

/// Per-request context: the parsed request and its extensions.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    /// Attaches an authenticated caller. Used by auth layers and tests.
    #[must_use]
    pub fn with_caller(mut self, caller: Caller) -> Self {
        self.extensions.insert(caller);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The authenticated caller, if the auth layer attached one.
    pub fn caller(&self) -> Option<&Caller> {
        self.extensions.get::<Caller>()
    }

    /// Client address: first `X-Forwarded-For` hop when `trust_forwarded_for`
    /// is set and the header is present, otherwise the socket peer IP.
    pub fn client_addr(&self, trust_forwarded_for: bool) -> Option<String> {
        if trust_forwarded_for {
            let forwarded = self
                .request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(addr) = forwarded {
                return Some(addr.to_owned());
            }
        }
        self.request.peer_addr().map(|addr| addr.ip().to_string())
    }

    /// Derives the caller identity used in rate-limit buckets and cache keys.
    pub fn identity(&self, trust_forwarded_for: bool) -> CallerIdentity {
        match self.caller() {
            Some(caller) => CallerIdentity::User(caller.user_id.clone()),
            None => CallerIdentity::Ip(
                self.client_addr(trust_forwarded_for)
                    .unwrap_or_else(|| "unknown".to_owned()),
            ),
        }
    }
}
