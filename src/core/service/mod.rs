//! Services: the load-balanced destinations routers dispatch to.
//!
//! A [`ServiceSet`] is built once per configuration snapshot. Each entry is
//! either a ready service or the error that kept it from being built, so a
//! broken service only takes down the routers that reference it.

pub mod http;
pub mod load_balancer;
pub mod target;
pub mod tcp;
pub mod udp;

#[cfg(test)]
pub(crate) mod testing;

use std::{collections::BTreeMap, sync::Arc};

use tokio_util::sync::CancellationToken;

pub use self::{
    http::HttpService,
    target::{BackendUrl, RuntimeTarget, TargetAddress},
    tcp::TcpService,
    udp::UdpService,
};
use crate::{
    config::{DynamicConfig, HealthCheckConfig},
    core::error::ConfigError,
    ports::{events::EventSink, http_client::HttpClient},
};

pub type Built<T> = Result<Arc<T>, ConfigError>;

pub(crate) fn validate_health_check(
    service: &str,
    config: &HealthCheckConfig,
) -> Result<(), ConfigError> {
    let reason = if config.interval_secs == 0 {
        "health check interval must be positive"
    } else if config.timeout_secs == 0 {
        "health check timeout must be positive"
    } else if config.unhealthy_threshold == 0 || config.healthy_threshold == 0 {
        "health check thresholds must be positive"
    } else if !config.path.starts_with('/') {
        "health check path must start with `/`"
    } else if config
        .expected_status
        .is_some_and(|status| !(100..=599).contains(&status))
    {
        "health check expected_status must be a valid HTTP status"
    } else {
        return Ok(());
    };
    Err(ConfigError::service(service, reason))
}

/// How a health job decides whether a target is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// GET `<target url><path>`; success is a 2xx/3xx or the expected status.
    Http,
    /// A TCP connect within the timeout.
    Tcp,
}

/// Periodic probing of the targets of one service.
#[derive(Debug, Clone)]
pub struct HealthCheckJob {
    pub service: String,
    pub config: HealthCheckConfig,
    pub probe: ProbeKind,
    pub targets: Vec<Arc<RuntimeTarget>>,
}

/// Every service of one snapshot, keyed by name.
#[derive(Default)]
pub struct ServiceSet {
    pub http: BTreeMap<String, Built<HttpService>>,
    pub tcp: BTreeMap<String, Built<TcpService>>,
    pub udp: BTreeMap<String, Built<UdpService>>,
}

impl ServiceSet {
    /// Builds every service in `config`.
    ///
    /// TCP services reuse the shutdown token of a same-named service from
    /// `previous`, so connections opened under an earlier snapshot are only
    /// closed once the service disappears from the configuration.
    pub fn build(
        config: &DynamicConfig,
        client: Arc<dyn HttpClient>,
        events: Arc<dyn EventSink>,
        previous: Option<&ServiceSet>,
    ) -> Self {
        let http = config
            .http
            .services
            .iter()
            .map(|(name, service)| {
                let built = HttpService::new(name, service, client.clone(), events.clone());
                (name.clone(), built.map(Arc::new))
            })
            .collect();

        let previous_tokens = previous.map(ServiceSet::tcp_tokens).unwrap_or_default();
        let tcp = config
            .tcp
            .services
            .iter()
            .map(|(name, service)| {
                let token = previous_tokens.get(name).cloned().unwrap_or_default();
                let built = TcpService::new(name, service, events.clone(), token);
                (name.clone(), built.map(Arc::new))
            })
            .collect();

        let udp = config
            .udp
            .services
            .iter()
            .map(|(name, service)| (name.clone(), UdpService::new(name, service).map(Arc::new)))
            .collect();

        Self { http, tcp, udp }
    }

    pub fn tcp_tokens(&self) -> BTreeMap<String, CancellationToken> {
        self.tcp
            .iter()
            .filter_map(|(name, service)| {
                let service = service.as_ref().ok()?;
                Some((name.clone(), service.shutdown_token().clone()))
            })
            .collect()
    }

    /// One job per valid service with a health check.
    pub fn health_jobs(&self, config: &DynamicConfig) -> Vec<HealthCheckJob> {
        let http = self.http.iter().filter_map(|(name, service)| {
            let service = service.as_ref().ok()?;
            let health = config.http.services.get(name)?.health_check.clone()?;
            Some(HealthCheckJob {
                service: name.clone(),
                config: health,
                probe: ProbeKind::Http,
                targets: service.targets().to_vec(),
            })
        });
        let tcp = self.tcp.iter().filter_map(|(name, service)| {
            let service = service.as_ref().ok()?;
            let health = config.tcp.services.get(name)?.health_check.clone()?;
            Some(HealthCheckJob {
                service: name.clone(),
                config: health,
                probe: ProbeKind::Tcp,
                targets: service.targets().to_vec(),
            })
        });
        http.chain(tcp).collect()
    }
}
