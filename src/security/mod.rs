//! Security middleware.
//!
//! - [`RateLimiter`]: per-route, per-caller request budgets with
//!   tier multipliers and `X-RateLimit-*` reporting.

pub mod rate_limit;

pub use rate_limit::{Decision, LimiterStatsSnapshot, Quota, RateLimiter};
