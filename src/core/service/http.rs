use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, extract::ConnectInfo, response::IntoResponse};
use hyper::{
    HeaderMap, Request, Response, Version,
    body::Body as _,
    header::{self, HeaderName, HeaderValue},
    http::request::Parts,
};
use tokio::time::timeout;
use tracing::Instrument;

use super::{
    load_balancer::TargetPool,
    target::{BackendUrl, RuntimeTarget, TargetAddress},
    validate_health_check,
};
use crate::{
    config::{HealthStatus, HttpServiceConfig, StickyConfig},
    core::{
        error::{ConfigError, DispatchError},
        handler::{HttpHandler, InboundScheme},
    },
    ports::{
        events::{EventSink, GatewayEvent},
        http_client::HttpClient,
    },
    tracing_setup::create_backend_span,
};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}

fn cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Load-balanced HTTP forwarding to the targets of one service.
pub struct HttpService {
    name: String,
    pool: TargetPool,
    sticky: Option<StickyConfig>,
    pass_host_header: bool,
    response_timeout: Option<Duration>,
    passive_health: bool,
    client: Arc<dyn HttpClient>,
    events: Arc<dyn EventSink>,
}

impl HttpService {
    pub fn new(
        name: &str,
        config: &HttpServiceConfig,
        client: Arc<dyn HttpClient>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigError> {
        let mut targets = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let url = BackendUrl::new(&server.url).map_err(|e| ConfigError::service(name, e))?;
            targets.push(Arc::new(RuntimeTarget::new(
                TargetAddress::Http(url),
                server.weight,
            )));
        }
        if let Some(health_check) = &config.health_check {
            validate_health_check(name, health_check)?;
        }
        if let Some(sticky) = &config.sticky {
            let valid = !sticky.cookie_name.is_empty()
                && sticky
                    .cookie_name
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
            if !valid {
                return Err(ConfigError::service(
                    name,
                    format!("invalid sticky cookie name `{}`", sticky.cookie_name),
                ));
            }
        }

        Ok(Self {
            name: name.to_string(),
            pool: TargetPool::new(targets, config.strategy),
            sticky: config.sticky.clone(),
            pass_host_header: config.pass_host_header,
            response_timeout: config
                .response_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            passive_health: config.health_check.is_some(),
            client,
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[Arc<RuntimeTarget>] {
        self.pool.targets()
    }

    /// Picks a target, forwards, and on a transport failure retries once on
    /// a different healthy target when the request had no body to replay.
    pub async fn dispatch(&self, req: Request<AxumBody>) -> Result<Response<AxumBody>, DispatchError> {
        let bound = self
            .sticky
            .as_ref()
            .and_then(|sticky| cookie(req.headers(), &sticky.cookie_name))
            .and_then(|value| self.pool.find_sticky(value))
            .cloned();
        let (target, is_bound) = match bound {
            Some(target) => (target, true),
            None => {
                let target = self
                    .pool
                    .select()
                    .cloned()
                    .ok_or_else(|| DispatchError::NoHealthyTarget(self.name.clone()))?;
                (target, false)
            }
        };

        let replayable = req.body().is_end_stream() || req.body().size_hint().exact() == Some(0);
        let (parts, body) = req.into_parts();

        let err = match self.forward(&target, &parts, body).await {
            Ok(response) => return Ok(self.finish(response, &target, is_bound)),
            Err(err) => err,
        };
        self.demote(&target, &err);

        if !replayable {
            return Err(err);
        }
        let Some(retry) = self.pool.select_other(&target).cloned() else {
            return Err(err);
        };
        tracing::debug!(
            service = %self.name,
            failed = target.id(),
            retry = retry.id(),
            error = %err,
            "retrying on another target"
        );
        match self.forward(&retry, &parts, AxumBody::empty()).await {
            Ok(response) => Ok(self.finish(response, &retry, false)),
            Err(retry_err) => {
                self.demote(&retry, &retry_err);
                Err(retry_err)
            }
        }
    }

    async fn forward(
        &self,
        target: &RuntimeTarget,
        parts: &Parts,
        body: AxumBody,
    ) -> Result<Response<AxumBody>, DispatchError> {
        let backend_error = |reason: String| DispatchError::Backend {
            target: target.id().to_string(),
            reason,
        };
        let TargetAddress::Http(url) = target.address() else {
            return Err(backend_error("not an HTTP target".to_string()));
        };
        let uri = url
            .join(parts.uri.path_and_query())
            .map_err(|e| backend_error(e.to_string()))?;

        let mut request = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(body)
            .map_err(|e| backend_error(e.to_string()))?;
        *request.headers_mut() = self.forwarded_headers(parts);
        if url.is_h2c() {
            *request.version_mut() = Version::HTTP_2;
        }

        let span = create_backend_span(target.id(), parts.method.as_str(), parts.uri.path());
        let send = self.client.send_request(request).instrument(span);
        let result = match self.response_timeout {
            Some(limit) => timeout(limit, send)
                .await
                .map_err(|_| DispatchError::Timeout {
                    target: target.id().to_string(),
                    timeout: limit,
                })?,
            None => send.await,
        };
        let mut response = result.map_err(|e| backend_error(e.to_string()))?;
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }

    fn forwarded_headers(&self, parts: &Parts) -> HeaderMap {
        let mut headers = parts.headers.clone();
        strip_hop_by_hop(&mut headers);

        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            let client = peer.ip().to_canonical();
            let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {client}"),
                None => client.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let original_host = parts.headers.get(header::HOST).cloned().or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });
        if let Some(host) = &original_host
            && !headers.contains_key(&X_FORWARDED_HOST)
        {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }

        let scheme = parts
            .extensions
            .get::<InboundScheme>()
            .copied()
            .unwrap_or(InboundScheme::Http);
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(scheme.as_str()));

        // Without a Host header the client fills in the target's authority.
        headers.remove(header::HOST);
        if self.pass_host_header {
            if let Some(host) = original_host {
                headers.insert(header::HOST, host);
            }
        }
        headers
    }

    fn finish(
        &self,
        mut response: Response<AxumBody>,
        target: &RuntimeTarget,
        is_bound: bool,
    ) -> Response<AxumBody> {
        if let (Some(sticky), false) = (&self.sticky, is_bound) {
            let mut cookie = format!("{}={}; Path=/", sticky.cookie_name, target.cookie_value());
            if sticky.http_only {
                cookie.push_str("; HttpOnly");
            }
            if sticky.secure {
                cookie.push_str("; Secure");
            }
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        response
    }

    // Targets are demoted passively only when a probe loop exists to bring
    // them back.
    fn demote(&self, target: &RuntimeTarget, err: &DispatchError) {
        if self.passive_health && target.mark_unhealthy() {
            tracing::warn!(
                service = %self.name,
                target = target.id(),
                error = %err,
                "target marked unhealthy after dispatch failure"
            );
            self.events.emit(GatewayEvent::TargetHealthChanged {
                service: self.name.clone(),
                target: target.id().to_string(),
                status: HealthStatus::Unhealthy,
            });
        }
    }
}

#[async_trait]
impl HttpHandler for HttpService {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        match self.dispatch(req).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(service = %self.name, error = %err, "dispatch failed");
                err.into_response()
            }
        }
    }
}
