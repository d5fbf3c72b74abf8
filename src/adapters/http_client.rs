use std::{fs, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::{Context, Result, eyre};
use http_body_util::BodyExt;
use hyper::{
    Method, Request, Response, StatusCode, Version, header, header::HeaderValue, http::uri::Scheme,
};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, ResponseFuture, connect::HttpConnector},
    rt::{TokioExecutor, TokioTimer},
};
use rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, aws_lc_rs, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_native_certs::load_native_certs;
use tokio::time::timeout;

use crate::{
    config::ServersTransportConfig,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Requests are sent as HTTP/1.1 and ALPN may upgrade to h2 for https
/// backends. A plain-http request marked HTTP/2 goes through a second,
/// HTTP/2-only pool (h2c with prior knowledge). Bodies stream in both
/// directions; nothing is buffered here.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
    h2c: Client<HttpConnector, AxumBody>,
    response_header_timeout: Option<Duration>,
}

impl HttpClientAdapter {
    /// Create a client with the default transport settings.
    pub fn new() -> Result<Self> {
        Self::from_config(&ServersTransportConfig::default())
    }

    /// Create a client following the `servers_transport` section.
    pub fn from_config(transport: &ServersTransportConfig) -> Result<Self> {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_nodelay(true);
        http_connector.set_keepalive(Some(Duration::from_secs(30)));
        if transport.dial_timeout_secs > 0 {
            http_connector.set_connect_timeout(Some(Duration::from_secs(transport.dial_timeout_secs)));
        }

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(Self::tls_config(transport)?)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector.clone());

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(Duration::from_secs(transport.idle_conn_timeout_secs))
            .pool_max_idle_per_host(transport.max_idle_conns_per_host);
        let client = builder.build::<_, AxumBody>(https_connector);
        let h2c = builder.http2_only(true).build::<_, AxumBody>(http_connector);

        tracing::debug!(
            dial_timeout_secs = transport.dial_timeout_secs,
            idle_conn_timeout_secs = transport.idle_conn_timeout_secs,
            max_idle_conns_per_host = transport.max_idle_conns_per_host,
            "backend HTTP client created"
        );
        Ok(Self {
            client,
            h2c,
            response_header_timeout: Some(transport.response_header_timeout_secs)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }

    fn tls_config(transport: &ServersTransportConfig) -> Result<ClientConfig> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;
        if transport.insecure_skip_verify {
            tracing::warn!("TLS certificate verification of backends is disabled");
            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth());
        }
        let roots = if transport.root_cas.is_empty() {
            native_roots()
        } else {
            let mut roots = RootCertStore::empty();
            for path in &transport.root_cas {
                add_pem_roots(&mut roots, path)?;
            }
            roots
        };
        Ok(builder.with_root_certificates(roots).with_no_client_auth())
    }

    /// Sets `Host` from the URI authority unless the caller already set one.
    fn ensure_host(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        if req.headers().contains_key(header::HOST) {
            return Ok(());
        }
        let authority = req
            .uri()
            .authority()
            .ok_or_else(|| HttpClientError::InvalidRequest("outgoing URI has no host".into()))?;
        let value = HeaderValue::from_str(authority.as_str())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }

    /// Plain-http HTTP/2 requests use the h2c pool; everything else is sent
    /// as HTTP/1.1 and negotiated by ALPN.
    fn dispatch(&self, mut req: Request<AxumBody>) -> ResponseFuture {
        if req.version() == Version::HTTP_2 && req.uri().scheme() == Some(&Scheme::HTTP) {
            self.h2c.request(req)
        } else {
            *req.version_mut() = Version::HTTP_11;
            self.client.request(req)
        }
    }
}

fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native_certs = load_native_certs();
    for cert in native_certs.certs {
        if roots.add(cert).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(errors = ?native_certs.errors, "some native certificates failed to load");
    }
    tracing::debug!(roots = roots.len(), "loaded native root certificates");
    roots
}

fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<()> {
    let pem = fs::read(path).wrap_err_with(|| format!("Failed to read root CA {}", path.display()))?;
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        let cert = cert.wrap_err_with(|| format!("Invalid PEM in {}", path.display()))?;
        roots
            .add(cert)
            .wrap_err_with(|| format!("Unusable root CA in {}", path.display()))?;
        added += 1;
    }
    if added == 0 {
        return Err(eyre!("No certificate found in {}", path.display()));
    }
    Ok(())
}

/// Verifier for `insecure_skip_verify`: any chain is accepted, handshake
/// signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::ensure_host(&mut req)?;

        let method = req.method().clone();
        let uri = req.uri().clone();
        tracing::debug!(method = %method, uri = %uri, version = ?req.version(), "sending request to backend");

        let pending = self.dispatch(req);
        let result = match self.response_header_timeout {
            Some(limit) => match timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(method = %method, uri = %uri, timeout = ?limit, "backend sent no response headers in time");
                    return Err(HttpClientError::Timeout(limit));
                }
            },
            None => pending.await,
        };
        match result {
            Ok(response) => {
                tracing::Span::current().record("http.status_code", response.status().as_u16());
                let (mut parts, body) = response.into_parts();
                // The body is re-framed by the inbound connection.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(body)))
            }
            Err(e) => {
                tracing::warn!(method = %method, uri = %uri, error = %e, "backend request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "request to {method} {uri} failed: {e}"
                )))
            }
        }
    }

    /// Accepts `http`, `https` and `h2c` URLs.
    async fn probe(&self, url: &str, limit: Duration) -> HttpClientResult<StatusCode> {
        let (uri, version) = match url.strip_prefix("h2c://") {
            Some(rest) => (format!("http://{rest}"), Version::HTTP_2),
            None => (url.to_string(), Version::HTTP_11),
        };
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .version(version)
            .body(AxumBody::empty())
            .map_err(|e| HttpClientError::InvalidRequest(e.to_string()))?;

        let response = match timeout(limit, self.dispatch(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(HttpClientError::ConnectionError(e.to_string())),
            Err(_) => return Err(HttpClientError::Timeout(limit)),
        };
        let status = response.status();
        // Drain so the connection can go back to the pool.
        let _ = timeout(limit, response.into_body().collect()).await;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use hyper::{
        server::conn::{http1, http2},
        service::service_fn,
    };
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    use super::*;

    fn answer(req: &Request<hyper::body::Incoming>, status: StatusCode) -> Response<AxumBody> {
        let host = req
            .headers()
            .get(header::HOST)
            .cloned()
            .unwrap_or(HeaderValue::from_static("none"));
        Response::builder()
            .status(status)
            .header("x-seen-host", host)
            .header("x-seen-version", format!("{:?}", req.version()))
            .body(AxumBody::from("ok"))
            .unwrap()
    }

    /// HTTP/2 cleartext backend; it does not speak HTTP/1.1 at all.
    async fn h2c_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(answer(&req, StatusCode::OK))
                    });
                    let _ = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr.to_string()
    }

    /// HTTPS backend with a self-signed certificate for `localhost`.
    async fn self_signed_backend() -> String {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let key = rustls::pki_types::PrivateKeyDer::try_from(certified.signing_key.serialize_der())
            .unwrap();
        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![certified.cert.der().clone()], key)
        .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(answer(&req, StatusCode::OK))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("https://localhost:{}", addr.port())
    }

    async fn backend(status: StatusCode) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(answer(&req, status))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn host_is_only_set_when_absent() {
        let mut req = Request::builder()
            .uri("http://10.0.0.1:8080/x")
            .body(AxumBody::empty())
            .unwrap();
        HttpClientAdapter::ensure_host(&mut req).unwrap();
        assert_eq!(req.headers()[header::HOST], "10.0.0.1:8080");

        let mut req = Request::builder()
            .uri("http://10.0.0.1:8080/x")
            .header(header::HOST, "app.example.com")
            .body(AxumBody::empty())
            .unwrap();
        HttpClientAdapter::ensure_host(&mut req).unwrap();
        assert_eq!(req.headers()[header::HOST], "app.example.com");

        let mut req = Request::builder().uri("/x").body(AxumBody::empty()).unwrap();
        assert!(HttpClientAdapter::ensure_host(&mut req).is_err());
    }

    #[tokio::test]
    async fn forwards_and_keeps_the_host_header() {
        let url = backend(StatusCode::OK).await;
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri(format!("{url}/path"))
            .header(header::HOST, "app.example.com")
            .body(AxumBody::empty())
            .unwrap();
        let response = client.send_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-seen-host"], "app.example.com");
    }

    #[tokio::test]
    async fn probe_reports_the_status() {
        let url = backend(StatusCode::SERVICE_UNAVAILABLE).await;
        let client = HttpClientAdapter::new().unwrap();
        let status = client
            .probe(&format!("{url}/health"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn probe_of_closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = HttpClientAdapter::new().unwrap();
        let result = client
            .probe(&format!("http://{addr}/health"), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(HttpClientError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn http2_requests_to_plain_backends_use_h2c() {
        let addr = h2c_backend().await;
        let client = HttpClientAdapter::new().unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/rpc"))
            .version(Version::HTTP_2)
            .body(AxumBody::empty())
            .unwrap();
        let response = client.send_request(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-seen-version"], "HTTP/2.0");

        let status = client
            .probe(&format!("h2c://{addr}/health"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn silent_backends_hit_the_response_header_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let client = HttpClientAdapter::from_config(&ServersTransportConfig {
            response_header_timeout_secs: 1,
            ..ServersTransportConfig::default()
        })
        .unwrap();
        let req = Request::builder()
            .uri(format!("http://{addr}/slow"))
            .body(AxumBody::empty())
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), client.send_request(req))
            .await
            .expect("the client must give up on its own");
        assert!(matches!(result, Err(HttpClientError::Timeout(_))));
    }

    #[tokio::test]
    async fn insecure_skip_verify_accepts_self_signed_backends() {
        let url = self_signed_backend().await;
        let request = || {
            Request::builder()
                .uri(format!("{url}/"))
                .body(AxumBody::empty())
                .unwrap()
        };

        let strict = HttpClientAdapter::new().unwrap();
        assert!(strict.send_request(request()).await.is_err());

        let insecure = HttpClientAdapter::from_config(&ServersTransportConfig {
            insecure_skip_verify: true,
            ..ServersTransportConfig::default()
        })
        .unwrap();
        let response = insecure.send_request(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn root_cas_must_be_readable_pem() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["ca.test".to_string()]).unwrap();
        let good = dir.path().join("ca.pem");
        std::fs::write(&good, certified.cert.pem()).unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let with_roots = |paths: Vec<std::path::PathBuf>| {
            HttpClientAdapter::from_config(&ServersTransportConfig {
                root_cas: paths,
                ..ServersTransportConfig::default()
            })
        };
        assert!(with_roots(vec![good]).is_ok());
        assert!(with_roots(vec![empty]).is_err());
        assert!(with_roots(vec![dir.path().join("missing.pem")]).is_err());
    }
}
