//! Rate limiting built atop `governor`.
//!
//! Requests are counted per client IP, per value of a header, or for the
//! whole router. `average` requests are allowed per `period` with bursts of
//! up to `burst` requests. A request without the key (no client address, or
//! the header is missing) is let through.
//!
//! Keyed limiters forget keys whose bucket has refilled; the sweep runs
//! inline every [`PRUNE_EVERY`] checks.
use std::{
    hash::Hash,
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    extract::ConnectInfo,
    response::IntoResponse,
};
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed, keyed::DefaultKeyedStateStore},
};
use hyper::{Request, Response, StatusCode, header::HeaderName};
use serde::Deserialize;

use super::MiddlewareSpec;
use crate::core::{
    error::ConfigError,
    handler::{HttpHandler, SharedHttpHandler},
};

pub type DirectRateLimiterImpl = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
pub type KeyedRateLimiterImpl<K> = RateLimiter<K, DefaultKeyedStateStore<K>, DefaultClock>;

pub const PRUNE_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitBy {
    #[default]
    ClientIp,
    Header,
    Router,
}

fn default_period() -> String {
    "1s".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitOptions {
    average: u32,
    #[serde(default = "default_period")]
    period: String,
    #[serde(default)]
    burst: Option<u32>,
    #[serde(default)]
    by: RateLimitBy,
    #[serde(default)]
    header_name: Option<String>,
}

enum Limiter {
    Router(DirectRateLimiterImpl),
    ClientIp(KeyedRateLimiterImpl<IpAddr>),
    Header {
        limiter: KeyedRateLimiterImpl<String>,
        header_name: HeaderName,
    },
}

fn allow_keyed<K>(limiter: &KeyedRateLimiterImpl<K>, key: Option<K>) -> bool
where
    K: Clone + Hash + Eq,
{
    key.is_none_or(|key| limiter.check_key(&key).is_ok())
}

impl Limiter {
    fn allows(&self, req: &Request<AxumBody>) -> bool {
        match self {
            Limiter::Router(limiter) => limiter.check().is_ok(),
            Limiter::ClientIp(limiter) => {
                let ip = req
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|info| info.0.ip());
                allow_keyed(limiter, ip)
            }
            Limiter::Header {
                limiter,
                header_name,
            } => {
                let value = req
                    .headers()
                    .get(header_name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                allow_keyed(limiter, value)
            }
        }
    }

    /// Drops keys whose state equals a fresh bucket.
    fn prune(&self) {
        match self {
            Limiter::Router(_) => {}
            Limiter::ClientIp(limiter) => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
            Limiter::Header { limiter, .. } => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
        }
    }

    fn tracked_keys(&self) -> usize {
        match self {
            Limiter::Router(_) => 0,
            Limiter::ClientIp(limiter) => limiter.len(),
            Limiter::Header { limiter, .. } => limiter.len(),
        }
    }
}

pub struct RateLimit {
    name: String,
    limiter: Limiter,
    checks: AtomicU64,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for RateLimit {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.limiter.prune();
            tracing::trace!(
                middleware = %self.name,
                keys = self.limiter.tracked_keys(),
                "rate limiter keys pruned"
            );
        }
        if !self.limiter.allows(&req) {
            tracing::debug!(middleware = %self.name, "rate limit exceeded");
            return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        }
        self.next.handle(req).await
    }
}

pub fn build(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    let options: RateLimitOptions = spec.options()?;

    let period = humantime::parse_duration(&options.period)
        .map_err(|e| spec.invalid(format!("invalid period `{}`: {e}", options.period)))?;
    let average = NonZeroU32::new(options.average)
        .ok_or_else(|| spec.invalid("average must be greater than 0"))?;
    let burst = NonZeroU32::new(options.burst.unwrap_or(options.average))
        .ok_or_else(|| spec.invalid("burst must be greater than 0"))?;
    let quota = Quota::with_period(period / average.get())
        .ok_or_else(|| spec.invalid(format!("period `{}` is too short", options.period)))?
        .allow_burst(burst);

    let limiter = match options.by {
        RateLimitBy::Router => Limiter::Router(RateLimiter::direct(quota)),
        RateLimitBy::ClientIp => Limiter::ClientIp(RateLimiter::keyed(quota)),
        RateLimitBy::Header => {
            let raw = options
                .header_name
                .as_deref()
                .ok_or_else(|| spec.invalid("header_name is required when limiting by header"))?;
            let header_name = HeaderName::from_bytes(raw.as_bytes())
                .map_err(|e| spec.invalid(format!("invalid header_name `{raw}`: {e}")))?;
            Limiter::Header {
                limiter: RateLimiter::keyed(quota),
                header_name,
            }
        }
    };

    tracing::debug!(
        middleware = spec.name,
        average = options.average,
        period = %options.period,
        burst = burst.get(),
        by = ?options.by,
        "rate limiter created"
    );

    Ok(Arc::new(RateLimit {
        name: spec.name.to_string(),
        limiter,
        checks: AtomicU64::new(0),
        next,
    }))
}
