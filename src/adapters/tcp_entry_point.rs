use std::{net::SocketAddr, time::Duration};

use eyre::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{core::reconciler::TcpSlot, metrics::ConnectionGuard};

/// Accept loop of one TCP entry point.
///
/// The router is loaded from the slot once per connection; a connection
/// stays on the router it was accepted with even if the slot is swapped
/// while it is open.
pub struct TcpEntryPoint {
    name: String,
    listener: TcpListener,
    slot: TcpSlot,
    connections: TaskTracker,
}

impl TcpEntryPoint {
    pub async fn bind(name: impl Into<String>, address: &str, slot: TcpSlot) -> Result<Self> {
        let name = name.into();
        let listener = TcpListener::bind(address)
            .await
            .wrap_err_with(|| format!("Failed to bind entry point '{name}' on {address}"))?;
        Ok(Self {
            name,
            listener,
            slot,
            connections: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `shutdown` fires, then waits up to `drain` for open
    /// connections to finish.
    pub async fn run(self, shutdown: CancellationToken, drain: Duration) {
        tracing::info!(
            entry_point = %self.name,
            address = ?self.listener.local_addr().ok(),
            "TCP entry point listening"
        );
        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    tracing::warn!(entry_point = %self.name, error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let router = self.slot.load_full();
            let name = self.name.clone();
            self.connections.spawn(async move {
                let _guard = ConnectionGuard::new(&name);
                router.route(stream, peer).await;
            });
        }

        self.connections.close();
        let open = self.connections.len();
        if open > 0 {
            tracing::info!(entry_point = %self.name, open, "draining connections");
        }
        if tokio::time::timeout(drain, self.connections.wait()).await.is_err() {
            tracing::warn!(
                entry_point = %self.name,
                open = self.connections.len(),
                "drain timeout elapsed with connections still open"
            );
        }
        tracing::info!(entry_point = %self.name, "TCP entry point stopped");
    }
}
