//! Middleware pipeline: composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, enabling request inspection,
//! short-circuit responses, and response decoration without coupling handlers
//! to infrastructure concerns. The guard layers in this crate
//! ([`RateLimiter`](crate::security::RateLimiter) and
//! [`ResponseCache`](crate::cache::ResponseCache)) are ordinary middleware.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`Pipeline`]: an ordered middleware stack in front of an endpoint handler.
//! - [`MiddlewareHandler`] / [`Handler`]: type-erased, cheaply-cloneable functions.
//! - [`LoggerMiddleware`]: built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, context::Context};

/// Boxed response future returned by handlers and middleware.
pub type BoxResponseFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

/// Type-erased async endpoint that turns a [`Context`] into a [`Response`].
///
/// In practice you never construct this type directly; pass any
/// `Fn(Context) -> impl Future<Output = Response>` to [`Pipeline::new`].
pub type Handler = Arc<dyn Fn(Context) -> BoxResponseFuture + Send + Sync + 'static>;

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler =
    Arc<dyn Fn(Context, Next) -> BoxResponseFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait automatically via the blanket impl
/// below.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> BoxResponseFuture;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxResponseFuture {
        Box::pin((self)(ctx))
    }
}

/// Erases a concrete handler into a shareable [`Handler`].
pub fn handler(h: impl IntoHandler) -> Handler {
    Arc::new(move |ctx| h.call(ctx))
}

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use gatehouse::middleware::{LoggerMiddleware, from_middleware};
///
/// let handler = from_middleware(Arc::new(LoggerMiddleware));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware, or the endpoint once the stack is exhausted.
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
    endpoint: Handler,
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Arc<[MiddlewareHandler]>, endpoint: Handler) -> Self {
        Self {
            middlewares,
            index: 0,
            endpoint,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// When every middleware has run, the request reaches the endpoint handler.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            (self.endpoint)(ctx).await
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture;
}

/// An ordered middleware stack in front of an endpoint handler.
///
/// Layers run in the order they were added: the first layer sees the request
/// first and the response last. Cloning a `Pipeline` is cheap.
///
/// # Examples
///
/// ```rust,no_run
/// use gatehouse::{Response, StatusCode, context::Context};
/// use gatehouse::middleware::{LoggerMiddleware, Pipeline};
///
/// let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::Ok) })
///     .layer(LoggerMiddleware);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Handler,
}

impl Pipeline {
    /// Creates a pipeline with no middleware in front of `endpoint`.
    pub fn new(endpoint: impl IntoHandler) -> Self {
        Self {
            middlewares: Arc::from(Vec::<MiddlewareHandler>::new()),
            endpoint: handler(endpoint),
        }
    }

    /// Appends a middleware layer beneath the ones already added.
    #[must_use]
    pub fn layer<M>(self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.layer_arc(Arc::new(middleware))
    }

    /// Like [`layer`](Self::layer) for middleware that is also held elsewhere,
    /// e.g. to read its statistics.
    #[must_use]
    pub fn layer_arc<M>(self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        let mut stack: Vec<MiddlewareHandler> = self.middlewares.iter().cloned().collect();
        stack.push(from_middleware(middleware));
        Self {
            middlewares: Arc::from(stack),
            endpoint: self.endpoint,
        }
    }

    /// Returns the endpoint handler at the bottom of the stack.
    pub fn endpoint(&self) -> Handler {
        Arc::clone(&self.endpoint)
    }

    /// Runs `ctx` through every layer and the endpoint.
    pub async fn handle(&self, ctx: Context) -> Response {
        Next::new(Arc::clone(&self.middlewares), Arc::clone(&self.endpoint))
            .run(ctx)
            .await
    }
}

/// Built-in middleware that logs each request's method, path, status, and duration.
///
/// `LoggerMiddleware` does not short-circuit; it always delegates to the next
/// middleware and records timing after the fact.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                elapsed = ?start.elapsed(),
                "request completed"
            );

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Method, Request, StatusCode};

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(&self, ctx: Context, next: Next) -> BoxResponseFuture {
            let tag = self.0;
            Box::pin(async move {
                let mut resp = next.run(ctx).await;
                resp.add_header("X-Order", tag);
                resp
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle(&self, _ctx: Context, _next: Next) -> BoxResponseFuture {
            Box::pin(async { Response::new(StatusCode::Forbidden) })
        }
    }

    fn ctx() -> Context {
        Context::new(Request::new(Method::Get, "/api/foo"))
    }

    #[tokio::test]
    async fn empty_pipeline_reaches_endpoint() {
        let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::Accepted) });
        assert_eq!(pipeline.handle(ctx()).await.status(), StatusCode::Accepted);
    }

    #[tokio::test]
    async fn layers_unwind_in_reverse_order() {
        let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::Ok) })
            .layer(Tag("outer"))
            .layer(Tag("inner"));
        let resp = pipeline.handle(ctx()).await;
        let order: Vec<_> = resp
            .headers()
            .iter()
            .filter(|(k, _)| *k == "X-Order")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(order, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let pipeline = Pipeline::new(move |_ctx: Context| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Response::new(StatusCode::Ok) }
        })
        .layer(Deny);
        assert_eq!(pipeline.handle(ctx()).await.status(), StatusCode::Forbidden);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::NotFound) })
            .layer(LoggerMiddleware);
        assert_eq!(pipeline.handle(ctx()).await.status(), StatusCode::NotFound);
    }
}
