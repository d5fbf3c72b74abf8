//! Handler contracts shared by routers, middlewares and services.
//!
//! Everything that sits in a request path implements one of two traits:
//! [`HttpHandler`] for HTTP requests and [`TcpHandler`] for raw connections.
//! Middlewares wrap a handler and return a handler, so a chain is just a
//! handler whose innermost link is a service.

use std::{future::Future, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};

/// Handles one HTTP request and always produces a response.
#[async_trait]
pub trait HttpHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody>;
}

pub type SharedHttpHandler = Arc<dyn HttpHandler>;

/// Any bidirectional byte stream a TCP handler can own.
pub trait IoStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IoStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A routed TCP connection handed to a [`TcpHandler`].
pub struct TcpConnection {
    pub stream: Box<dyn IoStream>,
    pub peer_addr: SocketAddr,
    /// SNI sent by the client, when the connection started with a ClientHello.
    pub server_name: Option<String>,
}

impl TcpConnection {
    pub fn new(stream: impl IoStream, peer_addr: SocketAddr) -> Self {
        Self {
            stream: Box::new(stream),
            peer_addr,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, server_name: Option<String>) -> Self {
        self.server_name = server_name;
        self
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer_addr", &self.peer_addr)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Owns a TCP connection until it is done with it. Dropping the stream closes it.
#[async_trait]
pub trait TcpHandler: Send + Sync + 'static {
    async fn serve(&self, conn: TcpConnection);
}

pub type SharedTcpHandler = Arc<dyn TcpHandler>;

/// Scheme of the inbound connection, stored in request extensions by the
/// entry point so forwarding can fill `X-Forwarded-Proto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundScheme {
    Http,
    Https,
}

impl InboundScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            InboundScheme::Http => "http",
            InboundScheme::Https => "https",
        }
    }
}

/// Adapts an async closure into an [`HttpHandler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> HttpHandler for HandlerFn<F>
where
    F: Fn(Request<AxumBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<AxumBody>> + Send + 'static,
{
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        (self.0)(req).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> SharedHttpHandler
where
    F: Fn(Request<AxumBody>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<AxumBody>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}
