use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, response::IntoResponse};
use base64::{Engine, engine::general_purpose::STANDARD};
use hyper::{
    Request, Response, StatusCode,
    header::{AUTHORIZATION, HeaderName, HeaderValue, WWW_AUTHENTICATE},
};
use serde::Deserialize;
use sha1::{Digest, Sha1};

use super::MiddlewareSpec;
use crate::core::{
    error::ConfigError,
    handler::{HttpHandler, SharedHttpHandler},
};

const DEFAULT_REALM: &str = "switchyard";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BasicAuthOptions {
    users: Vec<String>,
    #[serde(default)]
    realm: Option<String>,
    #[serde(default)]
    header_field: Option<String>,
    #[serde(default)]
    remove_header: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Secret {
    Plain(String),
    /// `{SHA}` followed by the base64 SHA-1 digest of the password.
    Sha1(Vec<u8>),
}

impl Secret {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw.strip_prefix("{SHA}") {
            Some(encoded) => STANDARD
                .decode(encoded)
                .map(Secret::Sha1)
                .map_err(|e| format!("invalid {{SHA}} digest: {e}")),
            None => Ok(Secret::Plain(raw.to_string())),
        }
    }

    fn verify(&self, password: &str) -> bool {
        match self {
            Secret::Plain(expected) => expected == password,
            Secret::Sha1(digest) => Sha1::digest(password.as_bytes()).as_slice() == digest.as_slice(),
        }
    }
}

pub struct BasicAuth {
    users: HashMap<String, Secret>,
    challenge: HeaderValue,
    header_field: Option<HeaderName>,
    remove_header: bool,
    next: SharedHttpHandler,
}

impl BasicAuth {
    fn authenticate(&self, req: &Request<AxumBody>) -> Option<String> {
        let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
        let (scheme, encoded) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return None;
        }
        let decoded = STANDARD.decode(encoded.trim()).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;
        let (user, password) = credentials.split_once(':')?;
        self.users
            .get(user)
            .filter(|secret| secret.verify(password))
            .map(|_| user.to_string())
    }

    fn unauthorized(&self) -> Response<AxumBody> {
        let mut response = (StatusCode::UNAUTHORIZED, "401 Unauthorized").into_response();
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, self.challenge.clone());
        response
    }
}

#[async_trait]
impl HttpHandler for BasicAuth {
    async fn handle(&self, mut req: Request<AxumBody>) -> Response<AxumBody> {
        let Some(user) = self.authenticate(&req) else {
            tracing::debug!("basic authentication failed");
            return self.unauthorized();
        };
        if let Some(field) = &self.header_field {
            if let Ok(value) = HeaderValue::from_str(&user) {
                req.headers_mut().insert(field.clone(), value);
            }
        }
        if self.remove_header {
            req.headers_mut().remove(AUTHORIZATION);
        }
        self.next.handle(req).await
    }
}

pub fn build(
    spec: &MiddlewareSpec<'_>,
    next: SharedHttpHandler,
) -> Result<SharedHttpHandler, ConfigError> {
    let options: BasicAuthOptions = spec.options()?;
    if options.users.is_empty() {
        return Err(spec.invalid("at least one user is required"));
    }

    let mut users = HashMap::with_capacity(options.users.len());
    for entry in &options.users {
        let (name, secret) = entry
            .split_once(':')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| spec.invalid("users must be formatted as `name:password`"))?;
        let secret = Secret::parse(secret).map_err(|e| spec.invalid(e))?;
        users.insert(name.to_string(), secret);
    }

    let realm = options.realm.as_deref().unwrap_or(DEFAULT_REALM);
    let challenge = HeaderValue::from_str(&format!("Basic realm=\"{realm}\""))
        .map_err(|e| spec.invalid(format!("invalid realm: {e}")))?;
    let header_field = options
        .header_field
        .as_deref()
        .map(|h| HeaderName::from_bytes(h.as_bytes()))
        .transpose()
        .map_err(|e| spec.invalid(format!("invalid header_field: {e}")))?;

    Ok(Arc::new(BasicAuth {
        users,
        challenge,
        header_field,
        remove_header: options.remove_header,
        next,
    }))
}
