//! Turns a configuration snapshot into per-entry-point routers.
//!
//! Construction runs in a fixed order: services, then middleware chains
//! (with services as terminals), then routers. Each stage hands the next one
//! handlers, never names, so nothing is looked up by string on the request
//! path. A failure is recorded against the entity it belongs to and only
//! excludes that entity and the routers depending on it.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{DynamicConfig, EntryPointConfig, HttpRouterConfig, TcpRouterConfig, Transport},
    core::{
        error::{ConfigError, not_found},
        handler::{
            HttpHandler, SharedHttpHandler, SharedTcpHandler, TcpConnection, TcpHandler,
            handler_fn,
        },
        middleware::{ChainBuilder, MiddlewareRegistry},
        router::{
            HttpRoute, HttpRouter, RouteKey, TcpRoute, TcpRouteTls, TcpRouter, TlsAcceptors,
            UdpRoute, UdpRouter,
        },
        rule::{CompiledRule, RuleKind},
        service::{Built, ServiceSet},
        status::{EntityStatus, RuntimeStatus},
    },
    ports::{
        certificates::CertificateResolver,
        events::{EventSink, GatewayEvent, Protocol},
        http_client::HttpClient,
    },
};

/// Everything built from one snapshot.
pub struct BuiltRouters {
    pub tcp: BTreeMap<String, Arc<TcpRouter>>,
    pub udp: BTreeMap<String, Arc<UdpRouter>>,
    pub services: ServiceSet,
    pub status: RuntimeStatus,
}

/// Terminal used to validate middleware definitions on their own.
struct Discard;

#[async_trait]
impl TcpHandler for Discard {
    async fn serve(&self, _conn: TcpConnection) {}
}

#[derive(Default)]
struct EntryPointRoutes {
    http: Vec<HttpRoute>,
    https: Vec<HttpRoute>,
    tcp: Vec<TcpRoute>,
    udp: Vec<UdpRoute>,
}

fn lookup<T>(services: &BTreeMap<String, Built<T>>, name: &str) -> Result<Arc<T>, ConfigError> {
    match services.get(name) {
        Some(Ok(service)) => Ok(service.clone()),
        Some(Err(err)) => Err(err.clone()),
        None => Err(ConfigError::UnknownService(name.to_string())),
    }
}

pub struct RouterFactory {
    entry_points: BTreeMap<String, EntryPointConfig>,
    http_client: Arc<dyn HttpClient>,
    events: Arc<dyn EventSink>,
    certificates: Option<Arc<dyn CertificateResolver>>,
    http_middlewares: MiddlewareRegistry<dyn HttpHandler>,
    tcp_middlewares: MiddlewareRegistry<dyn TcpHandler>,
    shutdown: CancellationToken,
}

impl RouterFactory {
    pub fn new(
        entry_points: BTreeMap<String, EntryPointConfig>,
        http_client: Arc<dyn HttpClient>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            entry_points,
            http_client,
            events,
            certificates: None,
            http_middlewares: MiddlewareRegistry::http_defaults(),
            tcp_middlewares: MiddlewareRegistry::tcp_defaults(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_certificates(mut self, resolver: Arc<dyn CertificateResolver>) -> Self {
        self.certificates = Some(resolver);
        self
    }

    pub fn with_http_middlewares(mut self, registry: MiddlewareRegistry<dyn HttpHandler>) -> Self {
        self.http_middlewares = registry;
        self
    }

    pub fn with_tcp_middlewares(mut self, registry: MiddlewareRegistry<dyn TcpHandler>) -> Self {
        self.tcp_middlewares = registry;
        self
    }

    /// HTTP connections served by the built routers drain when this fires.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn entry_points(&self) -> &BTreeMap<String, EntryPointConfig> {
        &self.entry_points
    }

    pub fn http_client(&self) -> &Arc<dyn HttpClient> {
        &self.http_client
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn build(
        &self,
        config: &DynamicConfig,
        previous: Option<&ServiceSet>,
        generation: u64,
    ) -> BuiltRouters {
        let mut status = RuntimeStatus::new(generation);
        let mut routes: BTreeMap<String, EntryPointRoutes> = self
            .entry_points
            .keys()
            .map(|name| (name.clone(), EntryPointRoutes::default()))
            .collect();

        let services = ServiceSet::build(
            config,
            self.http_client.clone(),
            self.events.clone(),
            previous,
        );
        record_services(&mut status, &services);
        self.check_middlewares(config, &mut status);

        // The store may be empty until a reload fills it; until then TLS
        // routers are reported as broken instead of failing every handshake.
        let resolver = self.certificates.clone().filter(|c| !c.is_empty());
        let tls = match resolver.map(TlsAcceptors::new).transpose() {
            Ok(tls) => Ok(tls),
            Err(e) => {
                tracing::error!(error = %e, "TLS is unavailable for this configuration");
                Err(e.to_string())
            }
        };

        for (name, router) in &config.http.routers {
            let mut entity = EntityStatus::default();
            let entry_points = self.resolve_entry_points(&router.entry_points, Transport::Tcp, &mut entity);
            match self.build_http_route(name, router, config, &services, &tls) {
                Ok(route) if entity.is_enabled() => {
                    let tls_route = router.tls.is_some();
                    for entry_point in &entry_points {
                        if let Some(slot) = routes.get_mut(entry_point) {
                            let list = if tls_route { &mut slot.https } else { &mut slot.http };
                            list.push(route.clone());
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => entity.add_error(err),
            }
            self.report(Protocol::Http, name, &entity);
            *status.http.router(name) = entity;
            status.http.mark_used(name, &router.service, &router.middlewares);
        }

        for (name, router) in &config.tcp.routers {
            let mut entity = EntityStatus::default();
            let entry_points = self.resolve_entry_points(&router.entry_points, Transport::Tcp, &mut entity);
            match self.build_tcp_route(name, router, config, &services, &tls) {
                Ok(route) if entity.is_enabled() => {
                    for entry_point in &entry_points {
                        if let Some(slot) = routes.get_mut(entry_point) {
                            slot.tcp.push(route.clone());
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => entity.add_error(err),
            }
            self.report(Protocol::Tcp, name, &entity);
            *status.tcp.router(name) = entity;
            status.tcp.mark_used(name, &router.service, &router.middlewares);
        }

        for (name, router) in &config.udp.routers {
            let mut entity = EntityStatus::default();
            let entry_points = self.resolve_entry_points(&router.entry_points, Transport::Udp, &mut entity);
            match lookup(&services.udp, &router.service) {
                Ok(service) if entity.is_enabled() => {
                    for entry_point in &entry_points {
                        if let Some(slot) = routes.get_mut(entry_point) {
                            slot.udp
                                .push(UdpRoute::new(name.clone(), router.priority, service.clone()));
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => entity.add_error(err),
            }
            *status.udp.router(name) = entity;
            status.udp.mark_used(name, &router.service, &[]);
        }

        let mut tcp = BTreeMap::new();
        let mut udp = BTreeMap::new();
        let mut udp_winners: BTreeMap<String, usize> = BTreeMap::new();
        let mut udp_conflicts = Vec::new();
        for (name, ep_routes) in routes {
            let Some(entry_point) = self.entry_points.get(&name) else {
                continue;
            };
            match entry_point.transport {
                Transport::Tcp => {
                    let router = self.assemble_tcp(&name, entry_point, ep_routes, &tls);
                    tcp.insert(name, Arc::new(router));
                }
                Transport::Udp => {
                    let (router, conflicts) = UdpRouter::elect(name.clone(), ep_routes.udp);
                    if let Some(winner) = router.router_name() {
                        *udp_winners.entry(winner.to_string()).or_default() += 1;
                    }
                    udp_conflicts.extend(conflicts);
                    udp.insert(name, Arc::new(router));
                }
            }
        }
        for (loser, err) in udp_conflicts {
            let entity = status.udp.router(&loser);
            if udp_winners.contains_key(&loser) {
                entity.add_warning(err);
            } else {
                entity.add_error(err);
            }
        }
        for (name, entity) in &status.udp.routers {
            self.report(Protocol::Udp, name, entity);
        }

        BuiltRouters {
            tcp,
            udp,
            services,
            status,
        }
    }

    fn build_http_route(
        &self,
        name: &str,
        router: &HttpRouterConfig,
        config: &DynamicConfig,
        services: &ServiceSet,
        tls: &Result<Option<TlsAcceptors>, String>,
    ) -> Result<HttpRoute, ConfigError> {
        let rule = CompiledRule::parse(&router.rule, RuleKind::Http)?;
        if let Some(tls_config) = &router.tls {
            if tls_config.passthrough {
                return Err(ConfigError::InvalidRouter(
                    "TLS passthrough is only available on TCP routers".to_string(),
                ));
            }
            require_tls(tls)?;
        }
        let service: SharedHttpHandler = lookup(&services.http, &router.service)?;
        let handler = ChainBuilder::new(&self.http_middlewares, &config.http.middlewares)
            .build(&router.middlewares, service)?;
        Ok(HttpRoute {
            key: RouteKey::new(name, router.priority, rule.specificity()),
            rule,
            handler,
        })
    }

    fn build_tcp_route(
        &self,
        name: &str,
        router: &TcpRouterConfig,
        config: &DynamicConfig,
        services: &ServiceSet,
        tls: &Result<Option<TlsAcceptors>, String>,
    ) -> Result<TcpRoute, ConfigError> {
        let rule = CompiledRule::parse(&router.rule, RuleKind::Tcp)?;
        let mode = match &router.tls {
            None if rule.requires_server_name() => {
                return Err(ConfigError::InvalidRouter(
                    "HostSNI with a host name needs a TLS router".to_string(),
                ));
            }
            None => TcpRouteTls::None,
            Some(tls_config) if tls_config.passthrough => TcpRouteTls::Passthrough,
            Some(_) => {
                require_tls(tls)?;
                TcpRouteTls::Terminate
            }
        };
        let service: SharedTcpHandler = lookup(&services.tcp, &router.service)?;
        let handler = ChainBuilder::new(&self.tcp_middlewares, &config.tcp.middlewares)
            .build(&router.middlewares, service)?;
        Ok(TcpRoute {
            key: RouteKey::new(name, router.priority, rule.specificity()),
            rule,
            tls: mode,
            handler,
        })
    }

    fn assemble_tcp(
        &self,
        name: &str,
        entry_point: &EntryPointConfig,
        routes: EntryPointRoutes,
        tls: &Result<Option<TlsAcceptors>, String>,
    ) -> TcpRouter {
        let has_plain_tcp = routes.tcp.iter().any(|r| r.tls == TcpRouteTls::None);
        let mut builder = TcpRouter::builder(name)
            .client_hello_timeout(Duration::from_millis(entry_point.client_hello_timeout_ms))
            .tls(tls.clone().ok().flatten())
            .shutdown(self.shutdown.clone());

        // Plain HTTP is the fallback for plaintext connections unless raw TCP
        // routes claim them.
        if !routes.http.is_empty() || !has_plain_tcp {
            builder = builder.http_handler(Arc::new(HttpRouter::new(
                name,
                routes.http,
                self.events.clone(),
            )));
        }
        if !routes.https.is_empty() {
            builder = builder.https_handler(Arc::new(HttpRouter::new(
                name,
                routes.https,
                self.events.clone(),
            )));
        }
        for route in routes.tcp {
            builder = builder.route(route);
        }
        builder.build()
    }

    /// Entry points a router is attached to. An empty list means every
    /// entry point of the router's transport.
    fn resolve_entry_points(
        &self,
        requested: &[String],
        transport: Transport,
        entity: &mut EntityStatus,
    ) -> Vec<String> {
        let resolved: Vec<String> = if requested.is_empty() {
            self.entry_points
                .iter()
                .filter(|(_, ep)| ep.transport == transport)
                .map(|(name, _)| name.clone())
                .collect()
        } else {
            requested
                .iter()
                .filter(|name| match self.entry_points.get(name.as_str()) {
                    Some(ep) if ep.transport == transport => true,
                    Some(_) => {
                        entity.add_warning(ConfigError::InvalidRouter(format!(
                            "entry point `{name}` does not carry this protocol"
                        )));
                        false
                    }
                    None => {
                        entity.add_warning(ConfigError::UnknownEntryPoint(name.to_string()));
                        false
                    }
                })
                .cloned()
                .collect()
        };
        if resolved.is_empty() {
            entity.add_error(ConfigError::InvalidRouter(
                "no usable entry point".to_string(),
            ));
        }
        resolved
    }

    fn check_middlewares(&self, config: &DynamicConfig, status: &mut RuntimeStatus) {
        let http = ChainBuilder::new(&self.http_middlewares, &config.http.middlewares);
        for name in config.http.middlewares.keys() {
            let entity = status.http.middleware(name);
            if let Err(err) = http.check(name, handler_fn(|_req| async { not_found() })) {
                entity.add_error(err);
            }
        }
        let tcp = ChainBuilder::new(&self.tcp_middlewares, &config.tcp.middlewares);
        for name in config.tcp.middlewares.keys() {
            let entity = status.tcp.middleware(name);
            if let Err(err) = tcp.check(name, Arc::new(Discard)) {
                entity.add_error(err);
            }
        }
    }

    fn report(&self, protocol: Protocol, router: &str, entity: &EntityStatus) {
        if entity.is_enabled() {
            tracing::debug!(protocol = protocol.as_str(), router, "router built");
            self.events.emit(GatewayEvent::RouterBuilt {
                protocol,
                router: router.to_string(),
            });
        } else {
            let error = entity.errors.join("; ");
            tracing::warn!(protocol = protocol.as_str(), router, error = %error, "router excluded");
            self.events.emit(GatewayEvent::RouterFailed {
                protocol,
                router: router.to_string(),
                error,
            });
        }
    }
}

fn require_tls(tls: &Result<Option<TlsAcceptors>, String>) -> Result<(), ConfigError> {
    match tls {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(ConfigError::InvalidRouter(
            "TLS termination needs at least one certificate".to_string(),
        )),
        Err(reason) => Err(ConfigError::InvalidRouter(format!("TLS is unavailable: {reason}"))),
    }
}

fn record_services(status: &mut RuntimeStatus, services: &ServiceSet) {
    fn record<T>(section: &mut BTreeMap<String, EntityStatus>, built: &BTreeMap<String, Built<T>>) {
        for (name, service) in built {
            let entity = section.entry(name.clone()).or_default();
            if let Err(err) = service {
                entity.add_error(err);
            }
        }
    }
    record(&mut status.http.services, &services.http);
    record(&mut status.tcp.services, &services.tcp);
    record(&mut status.udp.services, &services.udp);
}
