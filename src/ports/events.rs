use std::time::Duration;

use crate::config::HealthStatus;

/// Which router family an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A discrete observability event.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    TargetHealthChanged {
        service: String,
        target: String,
        status: HealthStatus,
    },
    RouterBuilt {
        protocol: Protocol,
        router: String,
    },
    RouterFailed {
        protocol: Protocol,
        router: String,
        error: String,
    },
    RequestCompleted {
        entry_point: String,
        router: Option<String>,
        method: String,
        status: u16,
        duration: Duration,
    },
}

/// Receives events. `emit` is called from request paths and must not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: GatewayEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: GatewayEvent) {}
}
