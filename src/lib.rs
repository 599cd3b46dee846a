//! # gatehouse
//!
//! Response caching and rate limiting middleware for an async HTTP/1.1 API
//! server, backed by a shared key-value store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gatehouse::cache::{MemoryStore, ResponseCache, TimeoutStore};
//! use gatehouse::config::GuardConfig;
//! use gatehouse::context::Context;
//! use gatehouse::middleware::{LoggerMiddleware, Pipeline};
//! use gatehouse::security::RateLimiter;
//! use gatehouse::{Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GuardConfig::default();
//!     let store = Arc::new(TimeoutStore::new(MemoryStore::new(), config.store.op_timeout()));
//!
//!     let pipeline = Pipeline::new(|_ctx: Context| async {
//!         Response::new(StatusCode::Ok).body("Hello, World!")
//!     })
//!     .layer(LoggerMiddleware)
//!     .layer(RateLimiter::new(store.clone(), &config.rate_limit)?)
//!     .layer(ResponseCache::new(store, &config.cache)?);
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.serve(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod policy;
pub mod security;
pub mod server;

#[cfg(test)]
mod test_support;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
