use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU8, AtomicU32, Ordering},
};

use hyper::{Uri, http::uri::PathAndQuery};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::config::{HealthCheckConfig, HealthStatus};

// Constants for health status to replace magic numbers
const HEALTH_STATUS_UNHEALTHY: u8 = 0;
const HEALTH_STATUS_HEALTHY: u8 = 1;

/// Errors related to backend operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum BackendError {
    /// Error when URL is invalid
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Error when a socket address is invalid
    #[error("Invalid backend address: {0}")]
    InvalidAddress(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// A type-safe representation of an HTTP backend URL
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendUrl {
    /// The underlying URL as a string, without trailing slash
    url: String,
    /// Scheme and authority, e.g. `http://10.0.0.1:8080`
    origin: String,
    /// Path component of the URL, prepended to forwarded request paths
    base_path: String,
    /// Whether the URL is secure (HTTPS)
    is_secure: bool,
    /// Cleartext HTTP/2 with prior knowledge (`h2c://`)
    is_h2c: bool,
}

impl BackendUrl {
    /// Creates a new BackendUrl if the provided string is a valid http(s) or
    /// h2c URL with a host.
    pub fn new(url: &str) -> BackendResult<Self> {
        let parsed = url::Url::parse(url)
            .map_err(|e| BackendError::InvalidUrl(format!("{url}: {e}")))?;

        let (is_secure, is_h2c) = match parsed.scheme() {
            "https" => (true, false),
            "http" => (false, false),
            "h2c" => (false, true),
            other => {
                return Err(BackendError::InvalidUrl(format!(
                    "Backend URL must use http, https or h2c, got {other}: {url}"
                )));
            }
        };
        if parsed.host_str().is_none() {
            return Err(BackendError::InvalidUrl(format!("missing host: {url}")));
        }
        if parsed.query().is_some() || parsed.fragment().is_some() {
            return Err(BackendError::InvalidUrl(format!(
                "query and fragment are not allowed: {url}"
            )));
        }

        // h2c travels as plain http on the wire.
        let origin = if is_h2c {
            format!(
                "http://{}",
                &parsed[url::Position::BeforeHost..url::Position::BeforePath]
            )
        } else {
            parsed[..url::Position::BeforePath].to_string()
        };
        let base_path = parsed.path().trim_end_matches('/').to_string();
        Ok(BackendUrl {
            url: url.trim_end_matches('/').to_string(),
            origin,
            base_path,
            is_secure,
            is_h2c,
        })
    }

    /// Get the underlying URL as a string reference
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// Check if the URL is using HTTPS
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    pub fn is_h2c(&self) -> bool {
        self.is_h2c
    }

    /// URL a health probe of `path` is sent to. Keeps the `h2c` scheme so
    /// the client knows to speak HTTP/2 without negotiation.
    pub fn probe_url(&self, path: &PathAndQuery) -> Result<String, hyper::http::Error> {
        let uri = self.join(Some(path))?.to_string();
        Ok(match uri.strip_prefix("http://") {
            Some(rest) if self.is_h2c => format!("h2c://{rest}"),
            _ => uri,
        })
    }

    /// Absolute URI for a request path (and query) forwarded to this backend.
    pub fn join(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri, hyper::http::Error> {
        let suffix = path_and_query.map_or("/", PathAndQuery::as_str);
        let uri = format!("{}{}{suffix}", self.origin, self.base_path);
        Ok(Uri::try_from(uri)?)
    }
}

impl FromStr for BackendUrl {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendUrl::new(s)
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Where a target lives: an HTTP origin or a raw socket address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddress {
    Http(BackendUrl),
    Socket(String),
}

impl TargetAddress {
    /// Parses a `host:port` socket target.
    pub fn socket(address: &str) -> BackendResult<Self> {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(TargetAddress::Socket(address.to_string()))
            }
            _ => Err(BackendError::InvalidAddress(format!(
                "expected host:port, got `{address}`"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetAddress::Http(url) => url.as_str(),
            TargetAddress::Socket(address) => address,
        }
    }
}

/// One backend endpoint of a service.
///
/// Health is the only thing that changes after construction; it is kept in
/// atomics so readers on the dispatch path never lock.
#[derive(Debug)]
pub struct RuntimeTarget {
    address: TargetAddress,
    weight: u32,
    cookie_value: String,
    /// Current health status (uses atomic for thread safety)
    status: AtomicU8, // Uses HEALTH_STATUS_* constants
    /// Counter for consecutive successful health checks
    consecutive_successes: AtomicU32,
    /// Counter for consecutive failed health checks
    consecutive_failures: AtomicU32,
}

impl RuntimeTarget {
    /// Creates a new target, initialized as healthy.
    pub fn new(address: TargetAddress, weight: u32) -> Self {
        let digest = Sha1::digest(address.as_str().as_bytes());
        let cookie_value = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        Self {
            address,
            weight,
            cookie_value,
            status: AtomicU8::new(HEALTH_STATUS_HEALTHY),
            consecutive_successes: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> &TargetAddress {
        &self.address
    }

    /// Display identity of the target (URL or `host:port`).
    pub fn id(&self) -> &str {
        self.address.as_str()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Opaque value identifying this target in a sticky-session cookie.
    pub fn cookie_value(&self) -> &str {
        &self.cookie_value
    }

    /// Get the current health status
    pub fn status(&self) -> HealthStatus {
        // Use Acquire ordering for better correctness when reading status
        if self.status.load(Ordering::Acquire) == HEALTH_STATUS_HEALTHY {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// Mark the target as healthy. Returns true if this call changed the status.
    pub fn mark_healthy(&self) -> bool {
        self.consecutive_failures.store(0, Ordering::Release);
        self.status
            .compare_exchange(
                HEALTH_STATUS_UNHEALTHY,
                HEALTH_STATUS_HEALTHY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the target as unhealthy. Returns true if this call changed the status.
    pub fn mark_unhealthy(&self) -> bool {
        self.consecutive_successes.store(0, Ordering::Release);
        self.status
            .compare_exchange(
                HEALTH_STATUS_HEALTHY,
                HEALTH_STATUS_UNHEALTHY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Feed one probe result through the thresholds of `config`.
    /// Returns the new status when the probe caused a transition.
    pub fn record_probe(&self, success: bool, config: &HealthCheckConfig) -> Option<HealthStatus> {
        if success {
            let successes = self.consecutive_successes.fetch_add(1, Ordering::AcqRel) + 1;
            self.consecutive_failures.store(0, Ordering::Release);
            if successes >= config.healthy_threshold && self.mark_healthy() {
                return Some(HealthStatus::Healthy);
            }
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            self.consecutive_successes.store(0, Ordering::Release);
            if failures >= config.unhealthy_threshold && self.mark_unhealthy() {
                return Some(HealthStatus::Unhealthy);
            }
        }
        None
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }
}
