use std::time::Duration;

use axum::{
    body::Body as AxumBody,
    response::{IntoResponse, Response},
};
use hyper::StatusCode;
use thiserror::Error;

/// Errors raised while compiling a configuration snapshot.
///
/// Every variant is scoped to the entity it is recorded against: a router
/// whose middleware is unknown is excluded, its neighbours are not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid rule `{rule}`: {reason}")]
    RuleSyntax { rule: String, reason: String },

    #[error("middleware `{0}` does not exist")]
    UnknownMiddleware(String),

    #[error("middleware `{name}` has unknown type `{kind}`")]
    UnknownMiddlewareType { name: String, kind: String },

    #[error("invalid configuration for middleware `{name}`: {reason}")]
    MiddlewareConfig { name: String, reason: String },

    #[error("service `{0}` does not exist")]
    UnknownService(String),

    #[error("entry point `{0}` does not exist")]
    UnknownEntryPoint(String),

    #[error("service `{name}` is invalid: {reason}")]
    InvalidService { name: String, reason: String },

    #[error("invalid router: {0}")]
    InvalidRouter(String),

    #[error("router conflicts with `{winner}` on entry point `{entry_point}`")]
    RouterConflict { winner: String, entry_point: String },
}

impl ConfigError {
    /// True for errors caused by a reference to an entity that is not defined
    /// in the snapshot, as opposed to an entity that is defined but invalid.
    pub fn is_unknown_reference(&self) -> bool {
        matches!(
            self,
            ConfigError::UnknownMiddleware(_)
                | ConfigError::UnknownService(_)
                | ConfigError::UnknownEntryPoint(_)
        )
    }

    pub(crate) fn middleware(name: &str, reason: impl std::fmt::Display) -> Self {
        ConfigError::MiddlewareConfig {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn service(name: &str, reason: impl std::fmt::Display) -> Self {
        ConfigError::InvalidService {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while dispatching a live request or connection.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error("no healthy target available for service `{0}`")]
    NoHealthyTarget(String),

    #[error("backend {target} failed: {reason}")]
    Backend { target: String, reason: String },

    #[error("backend {target} did not answer within {timeout:?}")]
    Timeout { target: String, timeout: Duration },
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::NoHealthyTarget(_) => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Backend { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

// Clients only ever see the canonical reason phrase.
impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = status.canonical_reason().unwrap_or("Error");
        (status, AxumBody::from(body)).into_response()
    }
}

/// The canonical "no route matched" response.
pub fn not_found() -> Response<AxumBody> {
    (StatusCode::NOT_FOUND, "404 page not found").into_response()
}
