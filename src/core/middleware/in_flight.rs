use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, response::IntoResponse};
use bytes::Bytes;
use hyper::{
    Request, Response, StatusCode,
    body::{Body, Frame, SizeHint},
};
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::MiddlewareSpec;
use crate::core::{
    error::ConfigError,
    handler::{HttpHandler, SharedHttpHandler, SharedTcpHandler, TcpConnection, TcpHandler},
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InFlightOptions {
    amount: u32,
}

fn permits(spec: &MiddlewareSpec<'_>) -> Result<Arc<Semaphore>, ConfigError> {
    let options: InFlightOptions = spec.options()?;
    if options.amount == 0 {
        return Err(spec.invalid("amount must be greater than 0"));
    }
    Ok(Arc::new(Semaphore::new(options.amount as usize)))
}

/// Caps concurrent connections; the ones over the cap are closed at once.
pub struct TcpInFlightLimit {
    permits: Arc<Semaphore>,
    next: SharedTcpHandler,
}

#[async_trait]
impl TcpHandler for TcpInFlightLimit {
    async fn serve(&self, conn: TcpConnection) {
        match self.permits.clone().try_acquire_owned() {
            Ok(_permit) => self.next.serve(conn).await,
            Err(_) => tracing::debug!(peer = %conn.peer_addr, "too many connections in flight"),
        }
    }
}

pub fn build_tcp(
    spec: &MiddlewareSpec<'_>,
    next: SharedTcpHandler,
) -> Result<SharedTcpHandler, ConfigError> {
    Ok(Arc::new(TcpInFlightLimit {
        permits: permits(spec)?,
        next,
    }))
}

/// Response body that holds its request's permit until it is dropped.
struct PermitBody {
    inner: AxumBody,
    _permit: OwnedSemaphorePermit,
}

impl Body for PermitBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.get_mut().inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Caps concurrent requests; the ones over the cap get a 429.
///
/// A request counts until its response body has been sent or dropped.
pub struct HttpInFlightLimit {
    permits: Arc<Semaphore>,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for HttpInFlightLimit {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();
        };
        self.next.handle(req).await.map(|inner| {
            AxumBody::new(PermitBody {
                inner,
                _permit: permit,
            })
        })
    }
}

pub fn build_http(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    Ok(Arc::new(HttpInFlightLimit {
        permits: permits(spec)?,
        next,
    }))
}
