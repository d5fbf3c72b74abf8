// End-to-end UDP routing through a reconciled configuration.
mod common;

use std::{net::SocketAddr, time::Duration};

use common::{config, start};
use serde_json::json;
use tokio::net::UdpSocket;

async fn udp_echo(tag: &'static str) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let mut reply = tag.as_bytes().to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

async fn ask(client: &UdpSocket, payload: &[u8]) -> Option<String> {
    client.send(payload).await.unwrap();
    let mut buf = [0u8; 512];
    let n = tokio::time::timeout(Duration::from_millis(1_000), client.recv(&mut buf))
        .await
        .ok()?
        .ok()?;
    Some(String::from_utf8_lossy(&buf[..n]).into_owned())
}

#[tokio::test(flavor = "multi_thread")]
async fn highest_priority_router_claims_the_entry_point() {
    let low = udp_echo("low:").await;
    let high = udp_echo("high:").await;
    let running = start(
        config(json!({
            "entry_points": {
                "dns": { "address": "127.0.0.1:0", "transport": "udp" }
            },
            "udp": {
                "routers": {
                    "a-low": { "service": "low" },
                    "b-high": { "service": "high", "priority": 10 }
                },
                "services": {
                    "low": { "servers": [{ "address": low.to_string() }] },
                    "high": { "servers": [{ "address": high.to_string() }] }
                }
            }
        })),
        None,
    )
    .await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(running.addr("dns")).await.unwrap();
    assert_eq!(ask(&client, b"q").await.as_deref(), Some("high:q"));

    let status = running.reconciler.status();
    assert!(status.udp.routers["b-high"].errors.is_empty());
    assert_eq!(status.udp.routers["a-low"].errors.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_follow_the_published_router() {
    let first = udp_echo("first:").await;
    let second = udp_echo("second:").await;
    let snapshot = |target: SocketAddr| {
        config(json!({
            "entry_points": {
                "dns": {
                    "address": "127.0.0.1:0",
                    "transport": "udp",
                    "udp_session_timeout_secs": 1
                }
            },
            "udp": {
                "routers": { "dns": { "service": "dns" } },
                "services": { "dns": { "servers": [{ "address": target.to_string() }] } }
            }
        }))
    };
    let running = start(snapshot(first), None).await;
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.connect(running.addr("dns")).await.unwrap();
    assert_eq!(ask(&client, b"1").await.as_deref(), Some("first:1"));

    running
        .reconciler
        .apply(&snapshot(second).dynamic())
        .await
        .unwrap();
    // An open session keeps its target until it expires.
    assert_eq!(ask(&client, b"2").await.as_deref(), Some("first:2"));
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(ask(&client, b"3").await.as_deref(), Some("second:3"));
}
