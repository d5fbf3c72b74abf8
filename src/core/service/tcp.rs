use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{io::copy_bidirectional, net::TcpStream, time::timeout};
use tokio_util::sync::CancellationToken;

use super::{
    load_balancer::TargetPool,
    target::{RuntimeTarget, TargetAddress},
    validate_health_check,
};
use crate::{
    config::{HealthStatus, TcpServiceConfig},
    core::{
        error::{ConfigError, DispatchError},
        handler::{TcpConnection, TcpHandler},
    },
    ports::events::{EventSink, GatewayEvent},
};

/// Relays raw connections to a load-balanced set of socket targets.
///
/// Every relay also watches the service's shutdown token, so removing the
/// service from the configuration closes the connections it still carries.
pub struct TcpService {
    name: String,
    pool: TargetPool,
    dial_timeout: Duration,
    passive_health: bool,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl TcpService {
    pub fn new(
        name: &str,
        config: &TcpServiceConfig,
        events: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let mut targets = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let address =
                TargetAddress::socket(&server.address).map_err(|e| ConfigError::service(name, e))?;
            targets.push(Arc::new(RuntimeTarget::new(address, server.weight)));
        }
        if let Some(health_check) = &config.health_check {
            validate_health_check(name, health_check)?;
        }
        if config.dial_timeout_secs == 0 {
            return Err(ConfigError::service(name, "dial_timeout_secs must be positive"));
        }

        Ok(Self {
            name: name.to_string(),
            pool: TargetPool::new(targets, config.strategy),
            dial_timeout: Duration::from_secs(config.dial_timeout_secs),
            passive_health: config.health_check.is_some(),
            events,
            shutdown,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[Arc<RuntimeTarget>] {
        self.pool.targets()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Dials a healthy target, retrying once on a different one.
    pub async fn connect(&self) -> Result<(TcpStream, Arc<RuntimeTarget>), DispatchError> {
        let target = self
            .pool
            .select()
            .cloned()
            .ok_or_else(|| DispatchError::NoHealthyTarget(self.name.clone()))?;
        let err = match self.dial(&target).await {
            Ok(stream) => return Ok((stream, target)),
            Err(err) => err,
        };
        self.demote(&target, &err);

        let Some(retry) = self.pool.select_other(&target).cloned() else {
            return Err(err);
        };
        match self.dial(&retry).await {
            Ok(stream) => Ok((stream, retry)),
            Err(err) => {
                self.demote(&retry, &err);
                Err(err)
            }
        }
    }

    async fn dial(&self, target: &RuntimeTarget) -> Result<TcpStream, DispatchError> {
        match timeout(self.dial_timeout, TcpStream::connect(target.id())).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => Err(DispatchError::Backend {
                target: target.id().to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(DispatchError::Timeout {
                target: target.id().to_string(),
                timeout: self.dial_timeout,
            }),
        }
    }

    fn demote(&self, target: &RuntimeTarget, err: &DispatchError) {
        if self.passive_health && target.mark_unhealthy() {
            tracing::warn!(
                service = %self.name,
                target = target.id(),
                error = %err,
                "target marked unhealthy after dial failure"
            );
            self.events.emit(GatewayEvent::TargetHealthChanged {
                service: self.name.clone(),
                target: target.id().to_string(),
                status: HealthStatus::Unhealthy,
            });
        }
    }
}

#[async_trait]
impl TcpHandler for TcpService {
    async fn serve(&self, conn: TcpConnection) {
        let (mut backend, target) = match self.connect().await {
            Ok(connected) => connected,
            Err(err) => {
                tracing::warn!(service = %self.name, peer = %conn.peer_addr, error = %err, "closing connection");
                return;
            }
        };
        let mut client = conn.stream;
        tokio::select! {
            result = copy_bidirectional(&mut client, &mut backend) => match result {
                Ok((sent, received)) => tracing::debug!(
                    service = %self.name,
                    target = target.id(),
                    bytes_sent = sent,
                    bytes_received = received,
                    "connection closed"
                ),
                Err(e) => tracing::debug!(service = %self.name, target = target.id(), error = %e, "connection ended"),
            },
            () = self.shutdown.cancelled() => {
                tracing::debug!(service = %self.name, target = target.id(), "service removed, closing connection");
            }
        }
    }
}
