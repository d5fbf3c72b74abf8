//! Publishes built routers to the entry points.
//!
//! Each entry point owns one [`ArcSwap`] slot. Listeners load the slot once
//! per accepted connection, so a swap never touches connections or requests
//! already being served: they finish on the graph they started with.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::health_checker::HealthChecker,
    config::DynamicConfig,
    core::{
        factory::{BuiltRouters, RouterFactory},
        router::{TcpRouter, UdpRouter},
        service::ServiceSet,
        status::RuntimeStatus,
    },
};

pub type TcpSlot = Arc<ArcSwap<TcpRouter>>;
pub type UdpSlot = Arc<ArcSwap<UdpRouter>>;

struct Published {
    generation: u64,
    services: ServiceSet,
    health: CancellationToken,
    probes: JoinSet<()>,
}

pub struct Reconciler {
    factory: RouterFactory,
    tcp: BTreeMap<String, TcpSlot>,
    udp: BTreeMap<String, UdpSlot>,
    status: ArcSwap<RuntimeStatus>,
    requested: AtomicU64,
    published: Mutex<Published>,
    shutdown: CancellationToken,
}

impl Reconciler {
    /// Creates one slot per entry point, holding the routers of an empty
    /// configuration until the first snapshot is applied.
    pub fn new(factory: RouterFactory, shutdown: CancellationToken) -> Self {
        let BuiltRouters {
            tcp,
            udp,
            services,
            status,
        } = factory.build(&DynamicConfig::default(), None, 0);
        Self {
            factory,
            tcp: tcp
                .into_iter()
                .map(|(name, router)| (name, Arc::new(ArcSwap::new(router))))
                .collect(),
            udp: udp
                .into_iter()
                .map(|(name, router)| (name, Arc::new(ArcSwap::new(router))))
                .collect(),
            status: ArcSwap::from_pointee(status),
            requested: AtomicU64::new(0),
            published: Mutex::new(Published {
                generation: 0,
                services,
                health: shutdown.child_token(),
                probes: JoinSet::new(),
            }),
            shutdown,
        }
    }

    pub fn tcp_slot(&self, entry_point: &str) -> Option<TcpSlot> {
        self.tcp.get(entry_point).cloned()
    }

    pub fn udp_slot(&self, entry_point: &str) -> Option<UdpSlot> {
        self.udp.get(entry_point).cloned()
    }

    /// Status of the most recently published snapshot.
    pub fn status(&self) -> Arc<RuntimeStatus> {
        self.status.load_full()
    }

    pub fn factory(&self) -> &RouterFactory {
        &self.factory
    }

    /// Builds `config` and publishes it to every entry point.
    ///
    /// Returns `None` when a newer snapshot was submitted while this one
    /// waited or was being built; the newer one wins and this build is
    /// dropped without being published.
    pub async fn apply(&self, config: &DynamicConfig) -> Option<Arc<RuntimeStatus>> {
        let generation = self.requested.fetch_add(1, Ordering::AcqRel) + 1;
        let mut published = self.published.lock().await;
        if self.superseded(generation, published.generation) {
            tracing::debug!(generation, "configuration superseded before build");
            return None;
        }

        let built = self
            .factory
            .build(config, Some(&published.services), generation);
        if self.superseded(generation, published.generation) {
            tracing::debug!(generation, "configuration superseded during build");
            return None;
        }

        let BuiltRouters {
            mut tcp,
            mut udp,
            services,
            status,
        } = built;
        for (name, slot) in &self.tcp {
            if let Some(router) = tcp.remove(name) {
                slot.store(router);
            }
        }
        for (name, slot) in &self.udp {
            if let Some(router) = udp.remove(name) {
                slot.store(router);
            }
        }

        // Long-lived connections of services that no longer exist are closed;
        // surviving services kept their token across the rebuild.
        let kept = services.tcp_tokens();
        for (name, token) in published.services.tcp_tokens() {
            if !kept.contains_key(&name) {
                tracing::info!(service = %name, "closing connections of removed TCP service");
                token.cancel();
            }
        }

        published.health.cancel();
        published.probes.abort_all();
        let health = self.shutdown.child_token();
        let checker = Arc::new(HealthChecker::new(
            self.factory.http_client().clone(),
            self.factory.events().clone(),
            health.clone(),
        ));
        let probes = checker.spawn(services.health_jobs(config));

        *published = Published {
            generation,
            services,
            health,
            probes,
        };
        let status = Arc::new(status);
        self.status.store(status.clone());

        let errors = status.errors();
        if errors.is_empty() {
            tracing::info!(generation, "configuration applied");
        } else {
            tracing::warn!(generation, failed = errors.len(), "configuration applied with errors");
        }
        Some(status)
    }

    fn superseded(&self, generation: u64, published: u64) -> bool {
        generation <= published || generation < self.requested.load(Ordering::Acquire)
    }

    /// Stops health checks and closes every long-lived TCP connection.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut published = self.published.lock().await;
        published.health.cancel();
        for token in published.services.tcp_tokens().into_values() {
            token.cancel();
        }
        while published.probes.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::{
            EntryPointConfig, HealthCheckConfig, HttpRouterConfig, HttpServerConfig,
            HttpServiceConfig, LoadBalanceStrategy, SocketServerConfig, TcpServiceConfig,
        },
        core::service::testing::{MockHttpClient, RecordingEventSink},
    };

    fn reconciler() -> Reconciler {
        let factory = RouterFactory::new(
            BTreeMap::from([("web".to_string(), EntryPointConfig::tcp("127.0.0.1:0"))]),
            Arc::new(MockHttpClient::default()),
            Arc::new(RecordingEventSink::default()),
        );
        Reconciler::new(factory, CancellationToken::new())
    }

    fn config_with_router(name: &str) -> DynamicConfig {
        let mut config = DynamicConfig::default();
        config.http.services.insert(
            "api".into(),
            HttpServiceConfig {
                servers: vec![HttpServerConfig {
                    url: "http://10.0.0.1:80".into(),
                    weight: 1,
                }],
                strategy: LoadBalanceStrategy::RoundRobin,
                sticky: None,
                health_check: Some(HealthCheckConfig::default()),
                pass_host_header: true,
                response_timeout_secs: None,
            },
        );
        config.http.routers.insert(
            name.into(),
            HttpRouterConfig {
                rule: "PathPrefix(`/`)".into(),
                service: "api".into(),
                entry_points: vec![],
                middlewares: vec![],
                priority: None,
                tls: None,
            },
        );
        config
    }

    fn tcp_config(services: &[&str]) -> DynamicConfig {
        let mut config = DynamicConfig::default();
        for name in services {
            config.tcp.services.insert(
                name.to_string(),
                TcpServiceConfig {
                    servers: vec![SocketServerConfig {
                        address: "127.0.0.1:5432".into(),
                        weight: 1,
                    }],
                    strategy: LoadBalanceStrategy::RoundRobin,
                    health_check: None,
                    dial_timeout_secs: 5,
                },
            );
        }
        config
    }

    #[tokio::test]
    async fn apply_swaps_the_entry_point_slot() {
        let reconciler = reconciler();
        let slot = reconciler.tcp_slot("web").unwrap();
        let before = slot.load_full();
        assert!(reconciler.tcp_slot("missing").is_none());

        let status = reconciler.apply(&config_with_router("api")).await.unwrap();
        assert_eq!(status.generation, 1);
        assert!(status.is_clean());

        let after = slot.load_full();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(reconciler.status().generation, 1);
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn newest_snapshot_wins() {
        let reconciler = Arc::new(reconciler());
        // Holding the lock makes both submissions queue behind it.
        let guard = reconciler.published.lock().await;
        let first = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.apply(&config_with_router("old")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.apply(&config_with_router("new")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(first.await.unwrap().is_none());
        let status = second.await.unwrap().unwrap();
        assert_eq!(status.generation, 2);
        assert!(status.http.routers.contains_key("new"));
        assert!(!reconciler.status().http.routers.contains_key("old"));
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn removed_tcp_services_are_cancelled() {
        let reconciler = reconciler();
        reconciler.apply(&tcp_config(&["db", "cache"])).await.unwrap();
        let tokens = reconciler.published.lock().await.services.tcp_tokens();

        reconciler.apply(&tcp_config(&["db"])).await.unwrap();
        assert!(!tokens["db"].is_cancelled());
        assert!(tokens["cache"].is_cancelled());

        reconciler.shutdown().await;
        assert!(tokens["db"].is_cancelled());
    }

    #[tokio::test]
    async fn health_checks_restart_per_snapshot() {
        let reconciler = reconciler();
        reconciler.apply(&config_with_router("api")).await.unwrap();
        let first = reconciler.published.lock().await.health.clone();
        reconciler.apply(&config_with_router("api")).await.unwrap();
        assert!(first.is_cancelled());
        assert_eq!(reconciler.published.lock().await.probes.len(), 1);
        reconciler.shutdown().await;
    }
}
