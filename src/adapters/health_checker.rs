use std::{sync::Arc, time::Duration};

use hyper::{StatusCode, http::uri::PathAndQuery};
use tokio::{net::TcpStream, task::JoinSet, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{HealthCheckConfig, HealthStatus},
    core::service::{HealthCheckJob, ProbeKind, RuntimeTarget, TargetAddress},
    ports::{
        events::{EventSink, GatewayEvent},
        http_client::HttpClient,
    },
};

/// Health checker adapter: probes the targets of every health-checked
/// service until its cancellation token fires.
///
/// One checker serves one snapshot. The reconciler cancels it when the next
/// snapshot is published, which stops every probe loop it started.
pub struct HealthChecker {
    http_client: Arc<dyn HttpClient>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl HealthChecker {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        events: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            http_client,
            events,
            shutdown,
        }
    }

    /// Spawns one probe loop per job.
    pub fn spawn(self: &Arc<Self>, jobs: Vec<HealthCheckJob>) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for job in jobs {
            set.spawn(self.clone().run(job));
        }
        set
    }

    /// Run the probe loop of one service. The targets of a round are probed
    /// concurrently, so a hanging target costs the others nothing.
    pub async fn run(self: Arc<Self>, job: HealthCheckJob) {
        let interval = Duration::from_secs(job.config.interval_secs);
        tracing::info!(
            service = %job.service,
            targets = job.targets.len(),
            interval_secs = job.config.interval_secs,
            timeout_secs = job.config.timeout_secs,
            "starting health checks"
        );

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
            let mut round = JoinSet::new();
            for (index, target) in job.targets.iter().enumerate() {
                let checker = self.clone();
                let target = target.clone();
                let config = job.config.clone();
                let kind = job.probe;
                round.spawn(async move { (index, checker.probe(kind, &target, &config).await) });
            }
            loop {
                let joined = tokio::select! {
                    () = self.shutdown.cancelled() => return,
                    joined = round.join_next() => joined,
                };
                match joined {
                    Some(Ok((index, outcome))) => self.record(&job, &job.targets[index], outcome),
                    Some(Err(e)) => {
                        tracing::warn!(service = %job.service, error = %e, "health probe task failed");
                    }
                    None => break,
                }
            }
            tracing::trace!(service = %job.service, "health check cycle completed");
        }
        tracing::debug!(service = %job.service, "health checks stopped");
    }

    /// Probes a single target once. `Err` carries a reason for logging.
    pub async fn probe(
        &self,
        kind: ProbeKind,
        target: &RuntimeTarget,
        config: &HealthCheckConfig,
    ) -> Result<(), String> {
        let limit = Duration::from_secs(config.timeout_secs);
        match (kind, target.address()) {
            (ProbeKind::Http, TargetAddress::Http(url)) => {
                let path = config
                    .path
                    .parse::<PathAndQuery>()
                    .map_err(|e| format!("invalid probe path: {e}"))?;
                let probe_url = url
                    .probe_url(&path)
                    .map_err(|e| format!("invalid probe url: {e}"))?;
                let status = self
                    .http_client
                    .probe(&probe_url, limit)
                    .await
                    .map_err(|e| e.to_string())?;
                if status_accepted(status, config.expected_status) {
                    Ok(())
                } else {
                    Err(format!("unexpected status {status}"))
                }
            }
            (ProbeKind::Tcp, TargetAddress::Socket(address)) => {
                match timeout(limit, TcpStream::connect(address.as_str())).await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no connection within {limit:?}")),
                }
            }
            (kind, address) => Err(format!(
                "{kind:?} probe cannot reach `{}`",
                address.as_str()
            )),
        }
    }

    fn record(&self, job: &HealthCheckJob, target: &RuntimeTarget, outcome: Result<(), String>) {
        let success = outcome.is_ok();
        if let Err(reason) = &outcome {
            tracing::info!(
                service = %job.service,
                target = target.id(),
                failures = target.consecutive_failures() + 1,
                threshold = job.config.unhealthy_threshold,
                reason = %reason,
                "health check failed"
            );
        }
        let Some(status) = target.record_probe(success, &job.config) else {
            return;
        };
        match status {
            HealthStatus::Healthy => {
                tracing::info!(service = %job.service, target = target.id(), "target is now healthy");
            }
            HealthStatus::Unhealthy => {
                tracing::warn!(service = %job.service, target = target.id(), "target is now unhealthy");
            }
        }
        self.events.emit(GatewayEvent::TargetHealthChanged {
            service: job.service.clone(),
            target: target.id().to_string(),
            status,
        });
    }
}

fn status_accepted(status: StatusCode, expected: Option<u16>) -> bool {
    match expected {
        Some(code) => status.as_u16() == code,
        None => status.is_success() || status.is_redirection(),
    }
}
