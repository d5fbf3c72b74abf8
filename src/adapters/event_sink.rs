use crate::{
    config::HealthStatus,
    metrics,
    ports::events::{EventSink, GatewayEvent},
};

/// Turns gateway events into `metrics` updates.
///
/// Every update is a synchronous facade call; nothing here blocks or
/// allocates beyond label strings. Failed router builds are also logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsEventSink;

impl MetricsEventSink {
    pub fn new() -> Self {
        metrics::describe();
        Self
    }
}

impl EventSink for MetricsEventSink {
    fn emit(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::TargetHealthChanged {
                service,
                target,
                status,
            } => {
                metrics::set_target_health(&service, &target, status == HealthStatus::Healthy);
            }
            GatewayEvent::RouterBuilt { protocol, .. } => {
                metrics::increment_router_builds(protocol.as_str(), true);
            }
            GatewayEvent::RouterFailed {
                protocol,
                router,
                error,
            } => {
                tracing::debug!(protocol = protocol.as_str(), router = %router, error = %error, "router build failed");
                metrics::increment_router_builds(protocol.as_str(), false);
            }
            GatewayEvent::RequestCompleted {
                entry_point,
                router,
                method,
                status,
                duration,
            } => {
                metrics::record_request(&entry_point, router.as_deref(), &method, status, duration);
            }
        }
    }
}
