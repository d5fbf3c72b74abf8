//! In-memory collaborators for unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};

use crate::ports::{
    events::{EventSink, GatewayEvent},
    http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Answers every request with 200 and an `x-backend` header naming the
/// authority it was sent to, unless that authority was told to fail.
#[derive(Default)]
pub struct MockHttpClient {
    requests: Mutex<Vec<(Uri, HeaderMap)>>,
    versions: Mutex<Vec<Version>>,
    failing: Mutex<HashSet<String>>,
    hanging: Mutex<HashSet<String>>,
    probe_status: Mutex<HashMap<String, StatusCode>>,
    delay: Option<Duration>,
}

impl MockHttpClient {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn fail(&self, authority: &str) {
        self.failing.lock().unwrap().insert(authority.to_string());
    }

    /// Probes of `authority` wait out their whole timeout.
    pub fn hang(&self, authority: &str) {
        self.hanging.lock().unwrap().insert(authority.to_string());
    }

    pub fn recover(&self, authority: &str) {
        self.failing.lock().unwrap().remove(authority);
    }

    pub fn set_probe_status(&self, url: &str, status: StatusCode) {
        self.probe_status
            .lock()
            .unwrap()
            .insert(url.to_string(), status);
    }

    pub fn authorities(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(uri, _)| uri.authority().map(|a| a.to_string()))
            .collect()
    }

    pub fn last_request(&self) -> Option<(Uri, HeaderMap)> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn last_version(&self) -> Option<Version> {
        self.versions.lock().unwrap().last().copied()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();
        self.requests
            .lock()
            .unwrap()
            .push((req.uri().clone(), req.headers().clone()));
        self.versions.lock().unwrap().push(req.version());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&authority) {
            return Err(HttpClientError::ConnectionError("connection refused".into()));
        }
        Ok(Response::builder()
            .header("x-backend", authority)
            .body(AxumBody::empty())
            .unwrap())
    }

    async fn probe(&self, url: &str, timeout: Duration) -> HttpClientResult<StatusCode> {
        let authority = url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        let hangs = self.hanging.lock().unwrap().contains(&authority);
        if hangs {
            tokio::time::sleep(timeout).await;
            return Err(HttpClientError::Timeout(timeout));
        }
        if self.failing.lock().unwrap().contains(&authority) {
            return Err(HttpClientError::ConnectionError("connection refused".into()));
        }
        Ok(self
            .probe_status
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(StatusCode::OK))
    }
}

/// Records every event it receives.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<GatewayEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<GatewayEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: GatewayEvent) {
        self.events.lock().unwrap().push(event);
    }
}
