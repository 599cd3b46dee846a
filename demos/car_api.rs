//! A small car-parts API behind the rate limiter and the response cache.
//!
//! ```text
//! cargo run --example car_api [demos/policy.json]
//!
//! curl -i localhost:8080/api/car-brands
//! curl -i -H 'Authorization: Bearer demo-premium' 'localhost:8080/api/parts/search?q=brake'
//! curl -s localhost:8080/api/stats
//! ```
//!
//! Set `RUST_LOG=gatehouse=debug` to watch cache and counter decisions.

use std::{sync::Arc, time::Duration};

use gatehouse::{
    Response, Server, StatusCode,
    cache::{MemoryStore, ResponseCache, TimeoutStore},
    config::GuardConfig,
    context::{Caller, Context, Subscription, SubscriptionStatus},
    middleware::{BoxResponseFuture, LoggerMiddleware, Middleware, Next, Pipeline},
    security::RateLimiter,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Resolves two fixed demo tokens to callers.
struct DemoAuth;

impl DemoAuth {
    fn caller_for(authorization: Option<&str>) -> Option<Caller> {
        match authorization?.strip_prefix("Bearer ")? {
            "demo-free" => Some(Caller::new("1")),
            "demo-premium" => Some(Caller::new("2").with_subscription(Subscription {
                status: SubscriptionStatus::Active,
                expires_at: None,
            })),
            _ => None,
        }
    }
}

impl Middleware for DemoAuth {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxResponseFuture {
        if let Some(caller) = Self::caller_for(ctx.request().headers().get("Authorization")) {
            ctx.extensions_mut().insert(caller);
        }
        Box::pin(next.run(ctx))
    }
}

fn catalog(ctx: &Context) -> Response {
    let request = ctx.request();
    match request.route_path() {
        "api/car-brands" => Response::json(
            StatusCode::Ok,
            &json!({ "brands": ["Toyota", "Ford", "Honda", "BMW"] }),
        )
        .header("X-Total-Count", "4"),
        "api/car-brands/popular" => {
            Response::json(StatusCode::Ok, &json!({ "brands": ["Toyota", "Honda"] }))
        }
        "api/parts/search" => Response::json(
            StatusCode::Ok,
            &json!({ "query": request.query_string().unwrap_or_default(), "parts": [] }),
        ),
        "api/auth/login" => Response::json(StatusCode::Ok, &json!({ "token": "demo-free" })),
        _ => Response::json(
            StatusCode::NotFound,
            &json!({ "success": false, "message": "Not found" }),
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => GuardConfig::from_json_file(path)?,
        None => GuardConfig::default(),
    };

    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(TimeoutStore::new(Arc::clone(&memory), config.store.op_timeout()));

    let limiter = RateLimiter::new(store.clone(), &config.rate_limit)?;
    let cache = ResponseCache::new(store, &config.cache)?;

    let stats_limiter = limiter.clone();
    let stats_cache = cache.clone();
    let pipeline = Pipeline::new(move |ctx: Context| {
        let response = if ctx.request().route_path() == "api/stats" {
            Response::json(
                StatusCode::Ok,
                &json!({
                    "cache": stats_cache.stats(),
                    "rate_limit": stats_limiter.stats(),
                }),
            )
        } else {
            catalog(&ctx)
        };
        async move { response }
    })
    .layer(LoggerMiddleware)
    .layer(DemoAuth)
    .layer(limiter)
    .layer(cache.clone());

    let report = cache
        .warm(["/api/car-brands", "/api/car-brands/popular"], &pipeline.endpoint())
        .await;
    info!(?report, "cache warmed");

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            let purged = memory.purge_expired().await;
            if purged > 0 {
                info!(purged, "expired store entries purged");
            }
        }
    });

    let server = Server::bind("127.0.0.1:8080").await?;
    server.serve(pipeline).await?;
    Ok(())
}
