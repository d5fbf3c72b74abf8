use std::{net::SocketAddr, sync::Arc, time::Duration};

use rustls::{
    ServerConfig,
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
    RouteKey,
    http::serve_connection,
    sni::{Classification, classify},
};
use crate::{
    core::{
        handler::{InboundScheme, IoStream, SharedHttpHandler, SharedTcpHandler, TcpConnection},
        rule::{CompiledRule, ConnectionMeta},
    },
    ports::certificates::CertificateResolver,
    tracing_setup::create_connection_span,
};

/// What a TCP route does with the TLS layer of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRouteTls {
    /// Plaintext route; only sees connections that did not start with TLS.
    None,
    /// Forward the encrypted bytes untouched.
    Passthrough,
    /// Complete the handshake locally and forward the decrypted stream.
    Terminate,
}

#[derive(Clone)]
pub struct TcpRoute {
    pub key: RouteKey,
    pub rule: CompiledRule,
    pub tls: TcpRouteTls,
    pub handler: SharedTcpHandler,
}

/// Bridges the [`CertificateResolver`] port into rustls.
#[derive(Debug)]
struct SniCertResolver(Arc<dyn CertificateResolver>);

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.0.resolve(client_hello.server_name())
    }
}

fn tls_acceptor(
    resolver: Arc<dyn CertificateResolver>,
    alpn: &[&[u8]],
) -> Result<TlsAcceptor, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver(resolver)));
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// TLS server settings shared by every entry point of a snapshot.
#[derive(Clone)]
pub struct TlsAcceptors {
    /// Offers `h2` and `http/1.1` for connections handed to the HTTPS handler.
    http: TlsAcceptor,
    /// No ALPN: the decrypted bytes go to a TCP service as they are.
    tcp: TlsAcceptor,
}

impl TlsAcceptors {
    pub fn new(resolver: Arc<dyn CertificateResolver>) -> Result<Self, rustls::Error> {
        Ok(Self {
            http: tls_acceptor(resolver.clone(), &[b"h2", b"http/1.1"])?,
            tcp: tls_acceptor(resolver, &[])?,
        })
    }
}

/// Decides, per accepted connection of one entry point, who gets it.
///
/// TLS connections go to the first matching TLS TCP route, then to the
/// HTTPS handler. Plaintext connections go to the first matching plaintext
/// TCP route, then to the HTTP handler. A connection nobody wants is closed.
pub struct TcpRouter {
    entry_point: String,
    client_hello_timeout: Duration,
    plain_routes: Vec<TcpRoute>,
    tls_routes: Vec<TcpRoute>,
    http: Option<SharedHttpHandler>,
    https: Option<SharedHttpHandler>,
    tls: Option<TlsAcceptors>,
    shutdown: CancellationToken,
}

impl TcpRouter {
    pub fn builder(entry_point: impl Into<String>) -> TcpRouterBuilder {
        TcpRouterBuilder {
            entry_point: entry_point.into(),
            client_hello_timeout: Duration::from_secs(5),
            routes: Vec::new(),
            http: None,
            https: None,
            tls: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Plaintext TCP routes never look at the ClientHello, so when nothing
    /// else is routed here the connection is handed over before the client
    /// has sent a byte. Protocols where the server speaks first need this.
    pub fn needs_classification(&self) -> bool {
        !self.tls_routes.is_empty() || self.http.is_some() || self.https.is_some()
    }

    pub fn has_http(&self) -> bool {
        self.http.is_some()
    }

    pub fn has_https(&self) -> bool {
        self.https.is_some()
    }

    /// Names of all TCP routes, TLS routes first.
    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.tls_routes
            .iter()
            .chain(&self.plain_routes)
            .map(|r| r.key.name.as_str())
    }

    pub async fn route<S: IoStream>(&self, stream: S, peer: SocketAddr) {
        let span = create_connection_span(&self.entry_point, &peer.to_string());
        self.dispatch(stream, peer).instrument(span).await;
    }

    async fn dispatch<S: IoStream>(&self, stream: S, peer: SocketAddr) {
        if !self.needs_classification() {
            self.dispatch_plain(stream, peer).await;
            return;
        }

        let (classification, stream) = match classify(stream, self.client_hello_timeout).await {
            Ok(classified) => classified,
            Err(err) => {
                tracing::debug!(peer = %peer, error = %err, "closing unclassified connection");
                return;
            }
        };

        match classification {
            Classification::Plain => self.dispatch_plain(stream, peer).await,
            Classification::Tls { server_name } => {
                if let Some(name) = &server_name {
                    tracing::Span::current().record("server_name", name.as_str());
                }
                self.dispatch_tls(stream, peer, server_name).await;
            }
        }
    }

    async fn dispatch_plain<S: IoStream>(&self, stream: S, peer: SocketAddr) {
        let meta = ConnectionMeta {
            server_name: None,
            peer,
        };
        if let Some(route) = self.plain_routes.iter().find(|r| r.rule.matches(&meta)) {
            tracing::Span::current().record("router", route.key.name.as_str());
            route.handler.serve(TcpConnection::new(stream, peer)).await;
        } else if let Some(http) = &self.http {
            serve_connection(stream, peer, http.clone(), InboundScheme::Http, self.shutdown.clone())
                .await;
        } else {
            tracing::debug!(peer = %peer, "no route for plaintext connection");
        }
    }

    async fn dispatch_tls<S: IoStream>(&self, stream: S, peer: SocketAddr, server_name: Option<String>) {
        let meta = ConnectionMeta {
            server_name: server_name.as_deref(),
            peer,
        };
        if let Some(route) = self.tls_routes.iter().find(|r| r.rule.matches(&meta)) {
            tracing::Span::current().record("router", route.key.name.as_str());
            match route.tls {
                TcpRouteTls::Terminate => {
                    let Some(acceptor) = self.tls.as_ref().map(|tls| &tls.tcp) else {
                        tracing::warn!(router = %route.key.name, "no certificates for TLS termination");
                        return;
                    };
                    let Some(tls) = self.handshake(acceptor, stream, peer).await else {
                        return;
                    };
                    let conn = TcpConnection::new(tls, peer).with_server_name(server_name);
                    route.handler.serve(conn).await;
                }
                TcpRouteTls::Passthrough | TcpRouteTls::None => {
                    let conn = TcpConnection::new(stream, peer).with_server_name(server_name);
                    route.handler.serve(conn).await;
                }
            }
            return;
        }

        match (&self.https, self.tls.as_ref().map(|tls| &tls.http)) {
            (Some(https), Some(acceptor)) => {
                let Some(tls) = self.handshake(acceptor, stream, peer).await else {
                    return;
                };
                serve_connection(tls, peer, https.clone(), InboundScheme::Https, self.shutdown.clone())
                    .await;
            }
            _ => tracing::debug!(peer = %peer, server_name = ?server_name, "no route for TLS connection"),
        }
    }

    async fn handshake<S: IoStream>(
        &self,
        acceptor: &TlsAcceptor,
        stream: S,
        peer: SocketAddr,
    ) -> Option<tokio_rustls::server::TlsStream<S>> {
        match timeout(self.client_hello_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Some(tls),
            Ok(Err(e)) => {
                tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
                None
            }
            Err(_) => {
                tracing::debug!(peer = %peer, "TLS handshake timed out");
                None
            }
        }
    }
}

/// Assembles a [`TcpRouter`]. Routes may be added in any order.
pub struct TcpRouterBuilder {
    entry_point: String,
    client_hello_timeout: Duration,
    routes: Vec<TcpRoute>,
    http: Option<SharedHttpHandler>,
    https: Option<SharedHttpHandler>,
    tls: Option<TlsAcceptors>,
    shutdown: CancellationToken,
}

impl TcpRouterBuilder {
    pub fn client_hello_timeout(mut self, limit: Duration) -> Self {
        self.client_hello_timeout = limit;
        self
    }

    pub fn route(mut self, route: TcpRoute) -> Self {
        self.routes.push(route);
        self
    }

    pub fn http_handler(mut self, handler: SharedHttpHandler) -> Self {
        self.http = Some(handler);
        self
    }

    pub fn https_handler(mut self, handler: SharedHttpHandler) -> Self {
        self.https = Some(handler);
        self
    }

    pub fn tls(mut self, acceptors: Option<TlsAcceptors>) -> Self {
        self.tls = acceptors;
        self
    }

    /// Token observed by HTTP connections served through this router; on
    /// cancellation they finish in-flight requests and close.
    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn build(self) -> TcpRouter {
        let (mut tls_routes, mut plain_routes): (Vec<_>, Vec<_>) = self
            .routes
            .into_iter()
            .partition(|r| r.tls != TcpRouteTls::None);
        tls_routes.sort_by(|a, b| a.key.cmp(&b.key));
        plain_routes.sort_by(|a, b| a.key.cmp(&b.key));

        TcpRouter {
            entry_point: self.entry_point,
            client_hello_timeout: self.client_hello_timeout,
            plain_routes,
            tls_routes,
            http: self.http,
            https: self.https,
            tls: self.tls,
            shutdown: self.shutdown,
        }
    }
}
