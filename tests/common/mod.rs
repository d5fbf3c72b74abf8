// Shared harness for end-to-end tests: local backends plus a running router.
#![allow(dead_code)]

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{Router, extract::Request, http::HeaderMap};
use switchyard::{
    CertificateStore, HttpClientAdapter, Reconciler, RouterFactory, TcpEntryPoint, UdpEntryPoint,
    config::{GatewayConfig, Transport},
    ports::events::NoopEventSink,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// HTTP backend answering `<name> <path>`, echoing `x-req` back as
/// `x-seen` and answering `/health` with 200.
pub async fn http_backend(name: &'static str) -> SocketAddr {
    let app = Router::new().fallback(move |headers: HeaderMap, req: Request| async move {
        let seen = headers
            .get("x-req")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();
        ([("x-seen", seen)], format!("{name} {}", req.uri().path()))
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub struct Running {
    pub addrs: BTreeMap<String, SocketAddr>,
    pub reconciler: Arc<Reconciler>,
    pub shutdown: CancellationToken,
}

impl Running {
    pub fn addr(&self, entry_point: &str) -> SocketAddr {
        self.addrs[entry_point]
    }

    pub fn url(&self, entry_point: &str, path: &str) -> String {
        format!("http://{}{path}", self.addr(entry_point))
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn install_crypto() {
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::aws_lc_rs::default_provider(),
    );
}

/// Binds every entry point on an ephemeral port and applies the routing part
/// of `config`.
pub async fn start(config: GatewayConfig, certificates: Option<Arc<CertificateStore>>) -> Running {
    install_crypto();
    let shutdown = CancellationToken::new();
    let mut factory = RouterFactory::new(
        config.entry_points.clone(),
        Arc::new(HttpClientAdapter::new().unwrap()),
        Arc::new(NoopEventSink),
    )
    .with_shutdown(shutdown.clone());
    if let Some(certificates) = certificates {
        factory = factory.with_certificates(certificates);
    }
    let reconciler = Arc::new(Reconciler::new(factory, shutdown.clone()));
    reconciler.apply(&config.dynamic()).await.unwrap();

    let mut addrs = BTreeMap::new();
    for (name, entry_point) in &config.entry_points {
        match entry_point.transport {
            Transport::Tcp => {
                let slot = reconciler.tcp_slot(name).unwrap();
                let listener = TcpEntryPoint::bind(name.as_str(), "127.0.0.1:0", slot)
                    .await
                    .unwrap();
                addrs.insert(name.clone(), listener.local_addr().unwrap());
                tokio::spawn(listener.run(shutdown.clone(), Duration::from_secs(1)));
            }
            Transport::Udp => {
                let slot = reconciler.udp_slot(name).unwrap();
                let timeout = Duration::from_secs(entry_point.udp_session_timeout_secs);
                let listener = UdpEntryPoint::bind(name.as_str(), "127.0.0.1:0", slot, timeout)
                    .await
                    .unwrap();
                addrs.insert(name.clone(), listener.local_addr().unwrap());
                tokio::spawn(listener.run(shutdown.clone()));
            }
        }
    }
    Running {
        addrs,
        reconciler,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// GET through the router with an explicit Host header; returns status and body.
pub async fn get(url: &str, host: &str) -> (u16, String) {
    let response = client().get(url).header("host", host).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

pub fn config(value: serde_json::Value) -> GatewayConfig {
    serde_json::from_value(value).unwrap()
}
