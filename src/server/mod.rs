//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests either to a plain
//! handler function ([`Server::run`]) or through a middleware [`Pipeline`]
//! ([`Server::serve`]). Every request is stamped with the peer address of its
//! connection before dispatch. Persistent connections (keep-alive) are the default.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::{
    context::Context,
    http::{
        StatusCode,
        request::{Request, RequestError},
        response::Response,
    },
    middleware::Pipeline,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server.
///
/// Binds to a TCP address and dispatches incoming HTTP/1.1 requests to a
/// handler function.
///
/// # Examples
///
/// ```rust,no_run
/// use gatehouse::server::Server;
/// use gatehouse::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs every request through `pipeline`, each in a fresh [`Context`].
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, pipeline: Pipeline) -> Result<(), ServerError> {
        self.run(move |request: Request| {
            let pipeline = pipeline.clone();
            async move { pipeline.handle(Context::new(request)).await }
        })
        .await
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. The handler is wrapped in an [`Arc`] and
    /// shared across all spawned Tokio tasks, so it must be `Send + Sync + 'static`.
    ///
    /// This method runs until the process is terminated or an unrecoverable
    /// listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "gatehouse listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Outcome of trying to cut one request off the front of the read buffer.
enum Frame {
    /// A complete request and the number of buffered bytes it occupies.
    Request(Request, usize),
    NeedMore,
    /// The connection cannot continue; send this and close.
    Reject(Response),
}

fn next_frame(buf: &[u8]) -> Frame {
    match Request::parse(buf) {
        Ok((request, body_offset)) => {
            let consumed = body_offset.saturating_add(request.content_length().unwrap_or(0));
            if consumed > MAX_REQUEST_SIZE {
                Frame::Reject(too_large())
            } else if buf.len() < consumed {
                Frame::NeedMore
            } else {
                Frame::Request(request, consumed)
            }
        }
        Err(RequestError::Incomplete) if buf.len() > MAX_REQUEST_SIZE => Frame::Reject(too_large()),
        Err(RequestError::Incomplete) => Frame::NeedMore,
        Err(e) => Frame::Reject(Response::new(StatusCode::BadRequest).body(format!("Bad Request: {e}"))),
    }
}

fn too_large() -> Response {
    Response::new(StatusCode::PayloadTooLarge).body("Request entity too large")
}

/// Serves one TCP connection until the peer closes it or asks to.
///
/// Buffered bytes are framed before the socket is read again, so pipelined
/// requests are answered in order without waiting for more input.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        match next_frame(&buf) {
            Frame::NeedMore => {
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    return Ok(());
                }
            }
            Frame::Reject(response) => {
                warn!(
                    peer = %peer_addr,
                    status = response.status().as_u16(),
                    "rejecting request and closing connection"
                );
                stream.write_all(&response.keep_alive(false).into_bytes()).await?;
                return Ok(());
            }
            Frame::Request(request, consumed) => {
                let _ = buf.split_to(consumed);
                let request = request.with_peer_addr(peer_addr);
                let keep_alive = request.is_keep_alive();
                debug!(
                    peer = %peer_addr,
                    method = %request.method(),
                    path = %request.path(),
                    "dispatching request"
                );

                let response = handler(request).await.keep_alive(keep_alive);
                stream.write_all(&response.into_bytes()).await?;
                stream.flush().await?;

                if !keep_alive {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpStream;

    use super::*;
    use crate::{
        cache::{MemoryStore, ResponseCache},
        config::GuardConfig,
        security::RateLimiter,
    };

    async fn exchange(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap().to_ascii_lowercase()
    }

    #[tokio::test]
    async fn peer_address_reaches_the_handler() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            let peer = req.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();
            Response::new(StatusCode::Ok).body(peer)
        }));

        let reply = exchange(addr, "GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n").await;
        assert!(reply.starts_with("http/1.1 200"));
        assert!(reply.ends_with("127.0.0.1"));
    }

    #[tokio::test]
    async fn pipeline_is_served_over_tcp() {
        let config = GuardConfig::default();
        let store = Arc::new(MemoryStore::new());
        let pipeline = Pipeline::new(|_ctx: Context| async {
            Response::new(StatusCode::Ok)
                .header("Content-Type", "application/json")
                .body(r#"{"brands":[]}"#)
        })
        .layer(RateLimiter::new(store.clone(), &config.rate_limit).unwrap())
        .layer(ResponseCache::new(store, &config.cache).unwrap());

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(pipeline));

        let request = "GET /api/car-brands HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        let first = exchange(addr, request).await;
        assert!(first.starts_with("http/1.1 200"));
        assert!(first.contains("x-ratelimit-limit: 120\r\n"));
        assert!(first.contains("x-ratelimit-remaining: 119\r\n"));
        assert!(first.contains("x-cache: miss\r\n"));

        let second = exchange(addr, request).await;
        assert!(second.contains("x-ratelimit-remaining: 118\r\n"));
        assert!(second.contains("x-cache: hit\r\n"));
    }

    #[test]
    fn framing_waits_for_the_declared_body() {
        let partial = b"POST /api/orders HTTP/1.1\r\nContent-Length: 4\r\n\r\nab";
        assert!(matches!(next_frame(partial), Frame::NeedMore));

        let full = b"POST /api/orders HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcdGET";
        match next_frame(full) {
            Frame::Request(request, consumed) => {
                assert_eq!(request.body().as_ref(), b"abcd");
                assert_eq!(consumed, full.len() - 3);
            }
            _ => panic!("expected a complete request"),
        }
    }

    #[test]
    fn oversized_content_length_is_rejected_up_front() {
        let head = b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n";
        match next_frame(head) {
            Frame::Reject(response) => assert_eq!(response.status(), StatusCode::PayloadTooLarge),
            _ => panic!("expected a 413"),
        }
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            Response::new(StatusCode::Ok).body(format!("[{}]", req.path()))
        }));

        let reply = exchange(
            addr,
            "GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(reply.matches("http/1.1 200").count(), 2);
        let first = reply.find("[/first]").unwrap();
        let second = reply.find("[/second]").unwrap();
        assert!(first < second);
        assert!(reply.ends_with("[/second]"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|_req: Request| async { Response::new(StatusCode::Ok) }));

        let reply = exchange(addr, "NOT A REQUEST\r\n\r\n").await;
        assert!(reply.starts_with("http/1.1 400"));
    }
}
