use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{
    HeaderMap, Request, Response,
    header::{HeaderName, HeaderValue},
};
use serde::Deserialize;

use super::MiddlewareSpec;
use crate::core::{
    error::ConfigError,
    handler::{HttpHandler, SharedHttpHandler},
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeadersOptions {
    #[serde(default)]
    custom_request_headers: BTreeMap<String, String>,
    #[serde(default)]
    custom_response_headers: BTreeMap<String, String>,
}

/// Header mutations; an empty value removes the header.
#[derive(Debug, Default)]
struct HeaderOps {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

impl HeaderOps {
    fn parse(spec: &MiddlewareSpec<'_>, raw: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut ops = HeaderOps::default();
        for (name, value) in raw {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| spec.invalid(format!("invalid header name `{name}`: {e}")))?;
            if value.is_empty() {
                ops.remove.push(header);
            } else {
                let value = HeaderValue::from_str(value)
                    .map_err(|e| spec.invalid(format!("invalid value for `{name}`: {e}")))?;
                ops.set.push((header, value));
            }
        }
        Ok(ops)
    }

    fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

/// Sets or removes request headers before the next handler and response
/// headers after it.
pub struct Headers {
    request: HeaderOps,
    response: HeaderOps,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for Headers {
    async fn handle(&self, mut req: Request<AxumBody>) -> Response<AxumBody> {
        self.request.apply(req.headers_mut());
        let mut response = self.next.handle(req).await;
        self.response.apply(response.headers_mut());
        response
    }
}

pub fn build(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    let options: HeadersOptions = spec.options()?;
    let request = HeaderOps::parse(spec, &options.custom_request_headers)?;
    let response = HeaderOps::parse(spec, &options.custom_response_headers)?;
    if request.is_empty() && response.is_empty() {
        return Err(spec.invalid("no header to set or remove"));
    }
    Ok(Arc::new(Headers {
        request,
        response,
        next,
    }))
}
