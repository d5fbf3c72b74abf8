//! Configuration data structures for switchyard.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde-friendly and include defaults so that minimal configs remain concise.
//!
//! A document has a static part (`entry_points`, `log`, `providers`) read once at
//! startup, and a dynamic part (`http`, `tcp`, `udp`, `tls`) that is re-applied on
//! every change without dropping traffic.
use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::middleware::MiddlewareOptions;

/// Root configuration document.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub entry_points: BTreeMap<String, EntryPointConfig>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub servers_transport: ServersTransportConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
}

impl GatewayConfig {
    /// The routing part of the document, as handed to the reconciler.
    pub fn dynamic(&self) -> DynamicConfig {
        DynamicConfig {
            http: self.http.clone(),
            tcp: self.tcp.clone(),
            udp: self.udp.clone(),
        }
    }
}

/// A complete routing snapshot. Every reload replaces the previous one wholesale.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct DynamicConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub udp: UdpConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

fn default_client_hello_timeout_ms() -> u64 {
    5_000
}

fn default_udp_session_timeout_secs() -> u64 {
    3
}

/// A listening socket. TCP entry points carry HTTP, HTTPS and TCP routers;
/// UDP entry points carry UDP routers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EntryPointConfig {
    pub address: String,
    #[serde(default)]
    pub transport: Transport,
    /// How long a new TCP connection may take to send its first bytes.
    #[serde(default = "default_client_hello_timeout_ms")]
    pub client_hello_timeout_ms: u64,
    /// Idle time after which a UDP session is forgotten.
    #[serde(default = "default_udp_session_timeout_secs")]
    pub udp_session_timeout_secs: u64,
}

impl EntryPointConfig {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            transport: Transport::Tcp,
            client_hello_timeout_ms: default_client_hello_timeout_ms(),
            udp_session_timeout_secs: default_udp_session_timeout_secs(),
        }
    }

    pub fn udp(address: impl Into<String>) -> Self {
        Self {
            transport: Transport::Udp,
            ..Self::tcp(address)
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Json,
        }
    }
}

/// Settings for the configuration sources themselves.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Quiet period after a change notification before the snapshot is re-read.
    pub debounce_ms: u64,
    /// Poll interval for HTTP configuration sources.
    pub poll_interval_secs: u64,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            poll_interval_secs: 10,
        }
    }
}

/// How connections to HTTP backends are made and pooled. Read at startup.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServersTransportConfig {
    /// Limit on establishing a backend connection.
    pub dial_timeout_secs: u64,
    /// Limit on waiting for response headers once the request is sent;
    /// 0 waits as long as the service's response timeout allows.
    pub response_header_timeout_secs: u64,
    /// How long an unused pooled connection is kept.
    pub idle_conn_timeout_secs: u64,
    pub max_idle_conns_per_host: usize,
    /// Accept any backend certificate.
    pub insecure_skip_verify: bool,
    /// PEM files of the authorities trusted for `https` backends, in place
    /// of the platform roots.
    pub root_cas: Vec<PathBuf>,
}

impl Default for ServersTransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 30,
            response_header_timeout_secs: 0,
            idle_conn_timeout_secs: 90,
            max_idle_conns_per_host: 200,
            insecure_skip_verify: false,
            root_cas: Vec::new(),
        }
    }
}

/// Certificates served for TLS-terminating routers, selected by SNI.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub certificates: Vec<CertificateConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CertificateConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Names served by this certificate, `*.example.com` wildcards included.
    /// May only be empty for the default certificate.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Served when the client sends no SNI or no other certificate matches.
    #[serde(default)]
    pub default: bool,
}

/// A middleware definition: a type tag plus type-specific options.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MiddlewareConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub options: MiddlewareOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Probe path for HTTP services; ignored for TCP services.
    pub path: String,
    /// Status a probe must return; any 2xx or 3xx when unset.
    pub expected_status: Option<u16>,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_secs: 2,
            path: "/health".to_string(),
            expected_status: None,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// TLS settings of a router. Its presence alone makes the router TLS-only.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct RouterTlsConfig {
    /// TCP routers only: forward the encrypted stream instead of terminating it.
    #[serde(default)]
    pub passthrough: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_sticky_cookie() -> String {
    "_switchyard_sticky".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HttpConfig {
    #[serde(default)]
    pub routers: BTreeMap<String, HttpRouterConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, HttpServiceConfig>,
    #[serde(default)]
    pub middlewares: BTreeMap<String, MiddlewareConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpRouterConfig {
    pub rule: String,
    pub service: String,
    /// Entry points to attach to; every TCP entry point when empty.
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tls: Option<RouterTlsConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpServerConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StickyConfig {
    #[serde(default = "default_sticky_cookie")]
    pub cookie_name: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_true")]
    pub http_only: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpServiceConfig {
    #[serde(default)]
    pub servers: Vec<HttpServerConfig>,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub sticky: Option<StickyConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default = "default_true")]
    pub pass_host_header: bool,
    #[serde(default)]
    pub response_timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TcpConfig {
    #[serde(default)]
    pub routers: BTreeMap<String, TcpRouterConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, TcpServiceConfig>,
    #[serde(default)]
    pub middlewares: BTreeMap<String, MiddlewareConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TcpRouterConfig {
    pub rule: String,
    pub service: String,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tls: Option<RouterTlsConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SocketServerConfig {
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_dial_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TcpServiceConfig {
    #[serde(default)]
    pub servers: Vec<SocketServerConfig>,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct UdpConfig {
    #[serde(default)]
    pub routers: BTreeMap<String, UdpRouterConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, UdpServiceConfig>,
}

/// UDP has nothing to match on: a router simply claims its entry points.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UdpRouterConfig {
    pub service: String,
    #[serde(default)]
    pub entry_points: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UdpServiceConfig {
    #[serde(default)]
    pub servers: Vec<SocketServerConfig>,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
}
