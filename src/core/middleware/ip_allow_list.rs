use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, extract::ConnectInfo, response::IntoResponse};
use hyper::{Request, Response, StatusCode};
use ipnetwork::IpNetwork;
use serde::Deserialize;

use super::MiddlewareSpec;
use crate::core::{
    error::ConfigError,
    handler::{HttpHandler, SharedHttpHandler, SharedTcpHandler, TcpConnection, TcpHandler},
    rule::parse_network,
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AllowListOptions {
    source_range: Vec<String>,
}

#[derive(Debug, Clone)]
struct AllowList(Vec<IpNetwork>);

impl AllowList {
    fn from_spec(spec: &MiddlewareSpec<'_>) -> Result<Self, ConfigError> {
        let options: AllowListOptions = spec.options()?;
        if options.source_range.is_empty() {
            return Err(spec.invalid("source_range must not be empty"));
        }
        options
            .source_range
            .iter()
            .map(|raw| parse_network(raw).map_err(|e| spec.invalid(e)))
            .collect::<Result<_, _>>()
            .map(AllowList)
    }

    fn allows(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.0.iter().any(|net| net.contains(ip))
    }
}

pub struct HttpIpAllowList {
    allowed: AllowList,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for HttpIpAllowList {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let client = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip());
        match client {
            Some(ip) if self.allowed.allows(ip) => self.next.handle(req).await,
            _ => {
                tracing::debug!(client = ?client, "request rejected by allow list");
                (StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
        }
    }
}

pub fn build_http(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    Ok(Arc::new(HttpIpAllowList {
        allowed: AllowList::from_spec(spec)?,
        next,
    }))
}

pub struct TcpIpAllowList {
    allowed: AllowList,
    next: SharedTcpHandler,
}

#[async_trait]
impl TcpHandler for TcpIpAllowList {
    async fn serve(&self, conn: TcpConnection) {
        if self.allowed.allows(conn.peer_addr.ip()) {
            self.next.serve(conn).await;
        } else {
            tracing::debug!(peer = %conn.peer_addr, "connection rejected by allow list");
        }
    }
}

pub fn build_tcp(
    spec: &MiddlewareSpec<'_>,
    next: SharedTcpHandler,
) -> Result<SharedTcpHandler, ConfigError> {
    Ok(Arc::new(TcpIpAllowList {
        allowed: AllowList::from_spec(spec)?,
        next,
    }))
}
