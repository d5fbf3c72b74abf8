use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body as AxumBody,
    response::IntoResponse,
};
use hyper::{
    Request, Response, StatusCode, Uri,
    header::{HeaderName, HeaderValue},
    http::uri::PathAndQuery,
};
use serde::Deserialize;

use super::MiddlewareSpec;
use crate::core::{
    error::ConfigError,
    handler::{HttpHandler, SharedHttpHandler},
};

pub const X_REPLACED_PATH: HeaderName = HeaderName::from_static("x-replaced-path");
pub const X_FORWARDED_PREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

/// Replaces the path of the request URI, keeping the query string.
pub(crate) fn rewrite_path(req: &mut Request<AxumBody>, path: &str) -> Result<(), hyper::http::Error> {
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    };
    let mut parts = req.uri().clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::try_from(path_and_query)?);
    *req.uri_mut() = Uri::from_parts(parts)?;
    Ok(())
}

fn rewrite_failed(err: hyper::http::Error) -> Response<AxumBody> {
    tracing::warn!(error = %err, "path rewrite produced an invalid URI");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReplacePathOptions {
    path: String,
}

pub struct ReplacePath {
    path: String,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for ReplacePath {
    async fn handle(&self, mut req: Request<AxumBody>) -> Response<AxumBody> {
        if let Ok(original) = HeaderValue::from_str(req.uri().path()) {
            req.headers_mut().insert(X_REPLACED_PATH, original);
        }
        if let Err(err) = rewrite_path(&mut req, &self.path) {
            return rewrite_failed(err);
        }
        self.next.handle(req).await
    }
}

pub fn build_replace_path(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    let options: ReplacePathOptions = spec.options()?;
    if !options.path.starts_with('/') {
        return Err(spec.invalid("path must start with `/`"));
    }
    PathAndQuery::try_from(options.path.as_str())
        .map_err(|e| spec.invalid(format!("invalid path: {e}")))?;
    Ok(Arc::new(ReplacePath {
        path: options.path,
        next,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StripPrefixOptions {
    prefixes: Vec<String>,
}

pub struct StripPrefix {
    prefixes: Vec<String>,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for StripPrefix {
    async fn handle(&self, mut req: Request<AxumBody>) -> Response<AxumBody> {
        let path = req.uri().path().to_string();
        let matched = self
            .prefixes
            .iter()
            .find_map(|prefix| path.strip_prefix(prefix.as_str()).map(|rest| (prefix, rest)));

        if let Some((prefix, rest)) = matched {
            let stripped = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            };
            if let Ok(value) = HeaderValue::from_str(prefix.trim_end_matches('/')) {
                req.headers_mut().insert(X_FORWARDED_PREFIX, value);
            }
            if let Err(err) = rewrite_path(&mut req, &stripped) {
                return rewrite_failed(err);
            }
        }
        self.next.handle(req).await
    }
}

pub fn build_strip_prefix(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    let options: StripPrefixOptions = spec.options()?;
    if options.prefixes.is_empty() {
        return Err(spec.invalid("at least one prefix is required"));
    }
    if let Some(bad) = options.prefixes.iter().find(|p| !p.starts_with('/')) {
        return Err(spec.invalid(format!("prefix `{bad}` must start with `/`")));
    }
    Ok(Arc::new(StripPrefix {
        prefixes: options.prefixes,
        next,
    }))
}
