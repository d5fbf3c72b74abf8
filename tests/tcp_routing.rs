// End-to-end TCP routing: SNI termination and passthrough, TLS-terminated
// HTTP on the same port, server-speaks-first and the ClientHello timeout.
mod common;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use common::{config, http_backend, start};
use rustls::{
    ClientConfig, RootCertStore, ServerConfig, crypto::aws_lc_rs, pki_types::ServerName,
};
use serde_json::json;
use switchyard::CertificateStore;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct Pem {
    cert: String,
    key: String,
}

fn self_signed(names: &[&str]) -> Pem {
    let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();
    Pem {
        cert: certified.cert.pem(),
        key: certified.signing_key.serialize_pem(),
    }
}

fn connector(pem: &Pem) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pem.cert.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn acceptor(pem: &Pem) -> TlsAcceptor {
    let certs = rustls_pemfile::certs(&mut pem.cert.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = rustls_pemfile::private_key(&mut pem.key.as_bytes())
        .unwrap()
        .unwrap();
    let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Echoes each read back prefixed with `tag`.
async fn echo<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, tag: &'static str) {
    let mut buf = [0u8; 1024];
    while let Ok(n) = stream.read(&mut buf).await {
        if n == 0 {
            break;
        }
        let mut reply = tag.as_bytes().to_vec();
        reply.extend_from_slice(&buf[..n]);
        if stream.write_all(&reply).await.is_err() {
            break;
        }
    }
}

async fn plain_echo_backend(tag: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(stream, tag));
        }
    });
    addr
}

async fn tls_echo_backend(pem: &Pem, tag: &'static str) -> SocketAddr {
    let acceptor = acceptor(pem);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(stream) = acceptor.accept(stream).await {
                    echo(stream, tag).await;
                }
            });
        }
    });
    addr
}

async fn greeting_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream.write_all(b"220 ready\r\n").await;
        }
    });
    addr
}

async fn roundtrip<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> String {
    stream.write_all(payload).await.unwrap();
    let mut buf = [0u8; 1024];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

struct Fixture {
    running: common::Running,
    local: Pem,
    upstream: Pem,
}

async fn fixture() -> Fixture {
    let local = self_signed(&["db.test", "secure.test"]);
    let upstream = self_signed(&["pass.test"]);
    let plain = plain_echo_backend("db:").await;
    let tls = tls_echo_backend(&upstream, "pass:").await;
    let greeter = greeting_backend().await;
    let web = http_backend("web").await;

    let certificates = Arc::new(CertificateStore::default());
    certificates
        .insert_pem(
            &["db.test".to_string(), "secure.test".to_string()],
            local.cert.as_bytes(),
            local.key.as_bytes(),
            false,
        )
        .unwrap();

    let running = start(
        config(json!({
            "entry_points": {
                "websecure": { "address": "127.0.0.1:0", "client_hello_timeout_ms": 300 },
                "smtp": { "address": "127.0.0.1:0" }
            },
            "http": {
                "routers": {
                    "secure": {
                        "rule": "Host(`secure.test`)",
                        "service": "web",
                        "entry_points": ["websecure"],
                        "tls": {}
                    }
                },
                "services": { "web": { "servers": [{ "url": format!("http://{web}") }] } }
            },
            "tcp": {
                "routers": {
                    "db": {
                        "rule": "HostSNI(`db.test`)",
                        "service": "plain",
                        "entry_points": ["websecure"],
                        "tls": {}
                    },
                    "pass": {
                        "rule": "HostSNI(`pass.test`)",
                        "service": "tls",
                        "entry_points": ["websecure"],
                        "tls": { "passthrough": true }
                    },
                    "mail": {
                        "rule": "HostSNI(`*`)",
                        "service": "greeter",
                        "entry_points": ["smtp"]
                    }
                },
                "services": {
                    "plain": { "servers": [{ "address": plain.to_string() }] },
                    "tls": { "servers": [{ "address": tls.to_string() }] },
                    "greeter": { "servers": [{ "address": greeter.to_string() }] }
                }
            }
        })),
        Some(certificates),
    )
    .await;
    assert!(
        running.reconciler.status().is_clean(),
        "{:?}",
        running.reconciler.status().errors()
    );
    Fixture {
        running,
        local,
        upstream,
    }
}

async fn tls_connect(
    addr: SocketAddr,
    pem: &Pem,
    sni: &'static str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    connector(pem)
        .connect(ServerName::try_from(sni).unwrap(), tcp)
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn terminated_tls_reaches_the_plain_service() {
    let fixture = fixture().await;
    let addr = fixture.running.addr("websecure");
    let mut stream = tls_connect(addr, &fixture.local, "db.test").await;
    assert_eq!(roundtrip(&mut stream, b"ping").await, "db:ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn passthrough_keeps_the_upstream_handshake() {
    let fixture = fixture().await;
    let addr = fixture.running.addr("websecure");
    // The client trusts only the upstream's certificate, so this handshake
    // succeeds only if the router did not terminate it.
    let mut stream = tls_connect(addr, &fixture.upstream, "pass.test").await;
    assert_eq!(roundtrip(&mut stream, b"ping").await, "pass:ping");
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_http_routers_share_the_port() {
    let fixture = fixture().await;
    let addr = fixture.running.addr("websecure");
    let mut stream = tls_connect(addr, &fixture.local, "secure.test").await;
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: secure.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("web /x"), "{response}");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_speaks_first_without_client_bytes() {
    let fixture = fixture().await;
    let mut stream = TcpStream::connect(fixture.running.addr("smtp")).await.unwrap();
    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("greeting must arrive without sending anything")
        .unwrap();
    assert_eq!(&buf[..n], b"220 ready\r\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_clients_are_closed_after_the_hello_timeout() {
    let fixture = fixture().await;
    let mut stream = TcpStream::connect(fixture.running.addr("websecure"))
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .expect("connection must be closed by the router");
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_server_names_are_refused() {
    let fixture = fixture().await;
    let tcp = TcpStream::connect(fixture.running.addr("websecure"))
        .await
        .unwrap();
    let result = connector(&fixture.local)
        .connect(ServerName::try_from("nobody.test").unwrap(), tcp)
        .await;
    assert!(result.is_err());
}
