//! Middleware registry and chain composition.
//!
//! A middleware is configured by name with a `type` tag and free-form
//! options. The registry maps type tags to constructors; the chain builder
//! resolves an ordered list of names against the snapshot's definitions and
//! wraps the terminal handler so that the first name ends up outermost.
//!
//! The same machinery serves HTTP (`dyn HttpHandler`) and connection-level
//! (`dyn TcpHandler`) middlewares.

pub mod basic_auth;
pub mod headers;
pub mod in_flight;
pub mod ip_allow_list;
pub mod path;
pub mod rate_limit;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use serde::de::DeserializeOwned;

use crate::{
    config::MiddlewareConfig,
    core::{
        error::ConfigError,
        handler::{HttpHandler, TcpHandler},
    },
};

/// Type-specific options of a middleware definition.
pub type MiddlewareOptions = serde_json::Map<String, serde_json::Value>;

/// The definition a constructor is invoked with.
#[derive(Debug, Clone, Copy)]
pub struct MiddlewareSpec<'a> {
    pub name: &'a str,
    pub options: &'a MiddlewareOptions,
}

impl MiddlewareSpec<'_> {
    /// Deserializes the options into the constructor's own option type.
    pub fn options<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(self.options.clone()))
            .map_err(|e| ConfigError::middleware(self.name, e))
    }

    pub fn invalid(&self, reason: impl std::fmt::Display) -> ConfigError {
        ConfigError::middleware(self.name, reason)
    }
}

/// Builds one middleware instance wrapping `next`.
pub type Constructor<H> = fn(&MiddlewareSpec<'_>, Arc<H>) -> Result<Arc<H>, ConfigError>;

/// Maps middleware type tags to constructors.
pub struct MiddlewareRegistry<H: ?Sized> {
    constructors: HashMap<String, Constructor<H>>,
}

impl<H: ?Sized> Default for MiddlewareRegistry<H> {
    fn default() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }
}

impl<H: ?Sized> MiddlewareRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the constructor for a type tag.
    pub fn register(&mut self, kind: &str, constructor: Constructor<H>) -> &mut Self {
        self.constructors.insert(kind.to_string(), constructor);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Constructor<H>> {
        self.constructors.get(kind).copied()
    }
}

impl MiddlewareRegistry<dyn HttpHandler> {
    /// Registry with every built-in HTTP middleware.
    pub fn http_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("headers", headers::build)
            .register("replace_path", path::build_replace_path)
            .register("strip_prefix", path::build_strip_prefix)
            .register("basic_auth", basic_auth::build)
            .register("rate_limit", rate_limit::build)
            .register("ip_allow_list", ip_allow_list::build_http)
            .register("in_flight_limit", in_flight::build_http);
        registry
    }
}

impl MiddlewareRegistry<dyn TcpHandler> {
    /// Registry with every built-in connection-level middleware.
    pub fn tcp_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register("ip_allow_list", ip_allow_list::build_tcp)
            .register("in_flight_limit", in_flight::build_tcp);
        registry
    }
}

/// Resolves middleware names against one snapshot's definitions.
pub struct ChainBuilder<'a, H: ?Sized> {
    registry: &'a MiddlewareRegistry<H>,
    definitions: &'a BTreeMap<String, MiddlewareConfig>,
}

impl<'a, H: ?Sized> ChainBuilder<'a, H> {
    pub fn new(
        registry: &'a MiddlewareRegistry<H>,
        definitions: &'a BTreeMap<String, MiddlewareConfig>,
    ) -> Self {
        Self {
            registry,
            definitions,
        }
    }

    /// Wraps `terminal` with the named middlewares, first name outermost.
    ///
    /// Every name is resolved before anything is instantiated, so an unknown
    /// name is reported even if an earlier middleware has bad options.
    pub fn build(&self, names: &[String], terminal: Arc<H>) -> Result<Arc<H>, ConfigError> {
        let mut resolved = Vec::with_capacity(names.len());
        for name in names {
            let definition = self
                .definitions
                .get(name)
                .ok_or_else(|| ConfigError::UnknownMiddleware(name.clone()))?;
            let constructor = self.registry.get(&definition.kind).ok_or_else(|| {
                ConfigError::UnknownMiddlewareType {
                    name: name.clone(),
                    kind: definition.kind.clone(),
                }
            })?;
            resolved.push((name.as_str(), &definition.options, constructor));
        }

        let mut next = terminal;
        for (name, options, constructor) in resolved.into_iter().rev() {
            next = constructor(&MiddlewareSpec { name, options }, next)?;
        }
        Ok(next)
    }

    /// Instantiates a single definition against a throwaway terminal, to
    /// surface option errors on the middleware itself.
    pub fn check(&self, name: &str, terminal: Arc<H>) -> Result<(), ConfigError> {
        self.build(std::slice::from_ref(&name.to_string()), terminal)
            .map(|_| ())
    }
}
