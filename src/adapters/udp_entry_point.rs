use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use eyre::{Context, Result, eyre};
use scc::{HashMap, hash_map::Entry};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{core::reconciler::UdpSlot, metrics};

const MAX_DATAGRAM: usize = 64 * 1024;
/// Client datagrams a session holds while it connects or forwards.
const SESSION_BACKLOG: usize = 256;

/// One client's affinity to an upstream target.
struct Session {
    inbound: mpsc::Sender<Bytes>,
    /// Milliseconds since the entry point started.
    last_seen: AtomicU64,
}

type Sessions = Arc<HashMap<SocketAddr, Arc<Session>>>;

/// Datagram relay of one UDP entry point.
///
/// The first datagram from a client address opens a session: the current
/// router's service picks a target, and every later datagram from that
/// client goes to the same target until the session has been idle for the
/// session timeout. Replies are sent back from the entry point's socket.
///
/// Each session resolves and connects its target in its own task, so the
/// receive loop never waits on a backend.
pub struct UdpEntryPoint {
    name: String,
    socket: Arc<UdpSocket>,
    slot: UdpSlot,
    session_timeout: Duration,
    sessions: Sessions,
    started: Instant,
    tasks: TaskTracker,
}

impl UdpEntryPoint {
    pub async fn bind(
        name: impl Into<String>,
        address: &str,
        slot: UdpSlot,
        session_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let socket = UdpSocket::bind(address)
            .await
            .wrap_err_with(|| format!("Failed to bind entry point '{name}' on {address}"))?;
        Ok(Self {
            name,
            socket: Arc::new(socket),
            slot,
            session_timeout,
            sessions: Arc::new(HashMap::new()),
            started: Instant::now(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Relays until `shutdown` fires, then closes every session.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            entry_point = %self.name,
            address = ?self.socket.local_addr().ok(),
            "UDP entry point listening"
        );
        let sessions_closed = shutdown.child_token();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (len, client) = match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable from an earlier reply surfaces here on some platforms.
                    tracing::debug!(entry_point = %self.name, error = %e, "recv failed");
                    continue;
                }
            };
            self.dispatch(client, Bytes::copy_from_slice(&buf[..len]), &sessions_closed)
                .await;
        }

        self.tasks.close();
        self.tasks.wait().await;
        metrics::set_udp_sessions(&self.name, 0);
        tracing::info!(entry_point = %self.name, "UDP entry point stopped");
    }

    /// Queues a datagram on its client's session, opening one if needed.
    ///
    /// The session is touched and fed while its map entry is locked, and a
    /// session only expires under that same lock, so a datagram is never
    /// queued on a session that is going away.
    async fn dispatch(&self, client: SocketAddr, datagram: Bytes, closed: &CancellationToken) {
        let now = millis_since(self.started);
        let queued = match self.sessions.entry_async(client).await {
            Entry::Occupied(entry) => {
                let session = entry.get();
                session.last_seen.store(now, Ordering::Relaxed);
                session.inbound.try_send(datagram)
            }
            Entry::Vacant(entry) => {
                let router = self.slot.load_full();
                let target = match router
                    .service()
                    .ok_or_else(|| eyre!("no UDP router on entry point"))
                    .and_then(|service| service.select_target().map_err(Into::into))
                {
                    Ok(target) => target.id().to_string(),
                    Err(e) => {
                        tracing::warn!(entry_point = %self.name, client = %client, error = %e, "dropping datagram");
                        return;
                    }
                };
                let (inbound, receiver) = mpsc::channel(SESSION_BACKLOG);
                let queued = inbound.try_send(datagram);
                let session = Arc::new(Session {
                    inbound,
                    last_seen: AtomicU64::new(now),
                });
                entry.insert_entry(session.clone());
                tracing::debug!(
                    entry_point = %self.name,
                    router = router.router_name().unwrap_or_default(),
                    client = %client,
                    target = %target,
                    "UDP session opened"
                );
                self.tasks.spawn(run_session(
                    SessionContext {
                        entry_point: self.name.clone(),
                        socket: self.socket.clone(),
                        sessions: self.sessions.clone(),
                        started: self.started,
                        timeout: self.session_timeout,
                        client,
                        target,
                    },
                    session,
                    receiver,
                    closed.clone(),
                ));
                queued
            }
        };
        metrics::set_udp_sessions(&self.name, self.sessions.len());
        match queued {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::debug!(entry_point = %self.name, client = %client, "session backlog full, dropping datagram");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(entry_point = %self.name, client = %client, "session closed, dropping datagram");
            }
        }
    }
}

fn millis_since(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

struct SessionContext {
    entry_point: String,
    socket: Arc<UdpSocket>,
    sessions: Sessions,
    started: Instant,
    timeout: Duration,
    client: SocketAddr,
    target: String,
}

impl SessionContext {
    fn idle_millis(&self, session: &Session) -> u64 {
        millis_since(self.started).saturating_sub(session.last_seen.load(Ordering::Relaxed))
    }
}

async fn connect_upstream(target: &str) -> Result<UdpSocket> {
    let target_addr = tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| eyre!("`{target}` did not resolve"))?;
    let local: SocketAddr = if target_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(target_addr).await?;
    Ok(upstream)
}

/// Connects the session's target, then relays both ways until the session
/// goes idle, fails or the entry point shuts down.
async fn run_session(
    ctx: SessionContext,
    session: Arc<Session>,
    mut inbound: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
) {
    let expired = match connect_upstream(&ctx.target).await {
        Ok(upstream) => relay(&ctx, &session, &mut inbound, &upstream, &closed).await,
        Err(e) => {
            tracing::warn!(
                entry_point = %ctx.entry_point,
                client = %ctx.client,
                target = %ctx.target,
                error = %e,
                "UDP session failed to connect"
            );
            false
        }
    };
    if !expired {
        let _ = ctx
            .sessions
            .remove_if_async(&ctx.client, |current| Arc::ptr_eq(current, &session))
            .await;
    }
    inbound.close();
    metrics::set_udp_sessions(&ctx.entry_point, ctx.sessions.len());
    tracing::debug!(entry_point = %ctx.entry_point, client = %ctx.client, "UDP session closed");
}

/// Returns true when the session expired and was already removed.
async fn relay(
    ctx: &SessionContext,
    session: &Arc<Session>,
    inbound: &mut mpsc::Receiver<Bytes>,
    upstream: &UdpSocket,
    closed: &CancellationToken,
) -> bool {
    let timeout_ms = ctx.timeout.as_millis() as u64;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let idle = ctx.idle_millis(session);
        if idle >= timeout_ms {
            let removed = ctx
                .sessions
                .remove_if_async(&ctx.client, |current| {
                    Arc::ptr_eq(current, session) && ctx.idle_millis(current) >= timeout_ms
                })
                .await;
            if removed.is_some() {
                return true;
            }
            // Touched since the check.
            continue;
        }
        let wait = Duration::from_millis(timeout_ms - idle);
        tokio::select! {
            () = closed.cancelled() => return false,
            datagram = inbound.recv() => {
                let Some(datagram) = datagram else { return false };
                if let Err(e) = upstream.send(&datagram).await {
                    tracing::debug!(
                        entry_point = %ctx.entry_point,
                        target = %ctx.target,
                        error = %e,
                        "upstream send failed"
                    );
                }
            }
            received = tokio::time::timeout(wait, upstream.recv(&mut buf)) => match received {
                // Idleness is re-checked at the top of the loop.
                Err(_elapsed) => {}
                Ok(Ok(len)) => {
                    session.last_seen.store(millis_since(ctx.started), Ordering::Relaxed);
                    if let Err(e) = ctx.socket.send_to(&buf[..len], ctx.client).await {
                        tracing::debug!(entry_point = %ctx.entry_point, client = %ctx.client, error = %e, "reply send failed");
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        entry_point = %ctx.entry_point,
                        target = %ctx.target,
                        error = %e,
                        "upstream receive failed"
                    );
                    return false;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::ArcSwap;

    use super::*;
    use crate::{
        config::{LoadBalanceStrategy, SocketServerConfig, UdpServiceConfig},
        core::{
            router::{UdpRoute, UdpRouter},
            service::UdpService,
        },
    };

    /// Echo server that prefixes every reply with its tag.
    async fn echo(tag: &'static str) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let mut reply = tag.as_bytes().to_vec();
                reply.extend_from_slice(&buf[..len]);
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    fn slot(targets: &[SocketAddr]) -> UdpSlot {
        let service = UdpService::new(
            "dns",
            &UdpServiceConfig {
                servers: targets
                    .iter()
                    .map(|addr| SocketServerConfig {
                        address: addr.to_string(),
                        weight: 1,
                    })
                    .collect(),
                strategy: LoadBalanceStrategy::RoundRobin,
            },
        )
        .unwrap();
        let (router, _) = UdpRouter::elect(
            "dns",
            vec![UdpRoute::new("dns", None, Arc::new(service))],
        );
        Arc::new(ArcSwap::from_pointee(router))
    }

    async fn exchange(client: &UdpSocket, payload: &[u8]) -> String {
        client.send(payload).await.unwrap();
        let mut buf = [0u8; 1024];
        let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    async fn client_for(addr: SocketAddr) -> UdpSocket {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        client
    }

    #[tokio::test]
    async fn sessions_stick_to_one_target() {
        let a = echo("a:").await;
        let b = echo("b:").await;
        let entry_point = UdpEntryPoint::bind("dns", "127.0.0.1:0", slot(&[a, b]), Duration::from_secs(5))
            .await
            .unwrap();
        let addr = entry_point.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(entry_point.run(shutdown.clone()));

        let first = client_for(addr).await;
        assert_eq!(exchange(&first, b"1").await, "a:1");
        assert_eq!(exchange(&first, b"2").await, "a:2");

        let second = client_for(addr).await;
        assert_eq!(exchange(&second, b"3").await, "b:3");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let a = echo("a:").await;
        let b = echo("b:").await;
        let entry_point = UdpEntryPoint::bind(
            "dns",
            "127.0.0.1:0",
            slot(&[a, b]),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let addr = entry_point.local_addr().unwrap();
        let sessions = entry_point.sessions.clone();
        let shutdown = CancellationToken::new();
        tokio::spawn(entry_point.run(shutdown.clone()));

        let client = client_for(addr).await;
        assert_eq!(exchange(&client, b"x").await, "a:x");
        assert_eq!(sessions.len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sessions.len(), 0);

        // A fresh session is balanced anew.
        assert_eq!(exchange(&client, b"y").await, "b:y");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn first_datagrams_of_concurrent_clients_all_get_through() {
        let a = echo("a:").await;
        let entry_point =
            UdpEntryPoint::bind("dns", "127.0.0.1:0", slot(&[a]), Duration::from_secs(5))
                .await
                .unwrap();
        let addr = entry_point.local_addr().unwrap();
        let sessions = entry_point.sessions.clone();
        let shutdown = CancellationToken::new();
        tokio::spawn(entry_point.run(shutdown.clone()));

        let mut clients = Vec::new();
        for _ in 0..8 {
            clients.push(client_for(addr).await);
        }
        // Several datagrams per client before any session has connected.
        for (index, client) in clients.iter().enumerate() {
            for seq in 0..3 {
                client.send(format!("{index}.{seq}").as_bytes()).await.unwrap();
            }
        }
        for (index, client) in clients.iter().enumerate() {
            let mut replies = Vec::new();
            let mut buf = [0u8; 64];
            for _ in 0..3 {
                let len = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                replies.push(String::from_utf8_lossy(&buf[..len]).into_owned());
            }
            replies.sort();
            assert_eq!(
                replies,
                (0..3).map(|seq| format!("a:{index}.{seq}")).collect::<Vec<_>>()
            );
        }
        assert_eq!(sessions.len(), 8);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn steady_traffic_keeps_a_session_alive() {
        let a = echo("a:").await;
        let b = echo("b:").await;
        let entry_point = UdpEntryPoint::bind(
            "dns",
            "127.0.0.1:0",
            slot(&[a, b]),
            Duration::from_millis(250),
        )
        .await
        .unwrap();
        let addr = entry_point.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(entry_point.run(shutdown.clone()));

        let client = client_for(addr).await;
        for round in 0..10 {
            let payload = round.to_string();
            assert_eq!(exchange(&client, payload.as_bytes()).await, format!("a:{round}"));
            tokio::time::sleep(Duration::from_millis(80)).await;
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn datagrams_without_a_router_are_dropped() {
        let (router, _) = UdpRouter::elect("dns", vec![]);
        let slot: UdpSlot = Arc::new(ArcSwap::from_pointee(router));
        let entry_point = UdpEntryPoint::bind("dns", "127.0.0.1:0", slot, Duration::from_secs(1))
            .await
            .unwrap();
        let addr = entry_point.local_addr().unwrap();
        let sessions = entry_point.sessions.clone();
        let shutdown = CancellationToken::new();
        tokio::spawn(entry_point.run(shutdown.clone()));

        let client = client_for(addr).await;
        client.send(b"lost").await.unwrap();
        let mut buf = [0u8; 16];
        let reply = tokio::time::timeout(Duration::from_millis(200), client.recv(&mut buf)).await;
        assert!(reply.is_err());
        assert_eq!(sessions.len(), 0);
        shutdown.cancel();
    }
}
