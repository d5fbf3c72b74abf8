use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, extract::ConnectInfo};
use hyper::{Request, Response, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::RouteKey;
use crate::{
    core::{
        error::not_found,
        handler::{HttpHandler, InboundScheme, IoStream, SharedHttpHandler},
        rule::CompiledRule,
    },
    ports::events::{EventSink, GatewayEvent},
    tracing_setup::create_request_span,
};

/// A compiled HTTP route: rule plus the chain it dispatches to.
#[derive(Clone)]
pub struct HttpRoute {
    pub key: RouteKey,
    pub rule: CompiledRule,
    pub handler: SharedHttpHandler,
}

/// Routes requests of one entry point. Built per snapshot; never mutated.
pub struct HttpRouter {
    entry_point: String,
    routes: Vec<HttpRoute>,
    events: Arc<dyn EventSink>,
}

impl HttpRouter {
    pub fn new(
        entry_point: impl Into<String>,
        mut routes: Vec<HttpRoute>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        routes.sort_by(|a, b| a.key.cmp(&b.key));
        Self {
            entry_point: entry_point.into(),
            routes,
            events,
        }
    }

    /// Route names in evaluation order.
    pub fn route_names(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.key.name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn find<B>(&self, req: &Request<B>) -> Option<&HttpRoute> {
        self.routes.iter().find(|route| route.rule.matches(req))
    }
}

#[async_trait]
impl HttpHandler for HttpRouter {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let started = Instant::now();
        let method = req.method().to_string();
        let span = create_request_span(&self.entry_point, &method, req.uri().path());

        let route = self.find(&req);
        let router = route.map(|r| r.key.name.clone());
        let response = match route {
            Some(route) => {
                span.record("router", route.key.name.as_str());
                route.handler.handle(req).instrument(span.clone()).await
            }
            None => not_found(),
        };

        let duration = started.elapsed();
        span.record("http.status_code", response.status().as_u16());
        span.record("duration_ms", duration.as_millis() as u64);
        self.events.emit(GatewayEvent::RequestCompleted {
            entry_point: self.entry_point.clone(),
            router,
            method,
            status: response.status().as_u16(),
            duration,
        });
        response
    }
}

/// Serves HTTP/1.1 and HTTP/2 on one accepted stream until the client goes
/// away or `shutdown` fires, in which case the connection is drained.
pub async fn serve_connection<S: IoStream>(
    stream: S,
    peer: SocketAddr,
    handler: SharedHttpHandler,
    scheme: InboundScheme,
    shutdown: CancellationToken,
) {
    let service = service_fn(move |mut req: Request<Incoming>| {
        let handler = handler.clone();
        async move {
            req.extensions_mut().insert(ConnectInfo(peer));
            req.extensions_mut().insert(scheme);
            let response = handler.handle(req.map(AxumBody::new)).await;
            Ok::<_, Infallible>(response)
        }
    });

    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(peer = %peer, error = %e, "HTTP connection ended with error");
    }
}
