//! Test doubles shared by unit tests across modules.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    Method, Request, Response, StatusCode,
    cache::{KeyValueStore, StoreError, StoreFuture},
    context::{Caller, Context, Subscription, SubscriptionStatus},
    middleware::{Handler, handler},
};

/// Every operation fails as if the backend were down.
pub struct FailingStore;

impl KeyValueStore for FailingStore {
    fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }

    fn put<'a>(&'a self, _key: &'a str, _value: Bytes, _ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
}

/// Reads succeed (always empty) but writes fail.
pub struct WriteFailingStore;

impl KeyValueStore for WriteFailingStore {
    fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async { Ok(None) })
    }

    fn put<'a>(&'a self, _key: &'a str, _value: Bytes, _ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(StoreError::Unavailable("read-only replica".into())) })
    }
}

/// Sleeps for `delay` before answering every operation with an empty result.
pub struct SlowStore {
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl KeyValueStore for SlowStore {
    fn get<'a>(&'a self, _key: &'a str) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(None)
        })
    }

    fn put<'a>(&'a self, _key: &'a str, _value: Bytes, _ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(())
        })
    }
}

/// An endpoint that answers with a fixed status and counts its invocations.
#[derive(Clone)]
pub struct CountingEndpoint {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
}

impl CountingEndpoint {
    pub fn new(status: StatusCode) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            status,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A handler whose body is `"<status> #<call number>"`, with the headers a
    /// paginated listing endpoint would set.
    pub fn handler(&self) -> Handler {
        let calls = Arc::clone(&self.calls);
        let status = self.status;
        handler(move |_ctx: Context| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Response::new(status)
                    .header("Content-Type", "application/json")
                    .header("X-Total-Count", "42")
                    .header("Set-Cookie", "session=abc")
                    .body(format!("{} #{n}", status.as_u16()))
            }
        })
    }
}

pub fn get(target: &str) -> Request {
    Request::new(Method::Get, target).with_peer_addr(([198, 51, 100, 7], 52000).into())
}

pub fn request(method: Method, target: &str) -> Request {
    Request::new(method, target).with_peer_addr(([198, 51, 100, 7], 52000).into())
}

pub fn anonymous(request: Request) -> Context {
    Context::new(request)
}

pub fn user(request: Request, id: &str) -> Context {
    Context::new(request).with_caller(Caller::new(id))
}

pub fn premium(request: Request, id: &str) -> Context {
    Context::new(request).with_caller(Caller::new(id).with_subscription(Subscription {
        status: SubscriptionStatus::Active,
        expires_at: None,
    }))
}
