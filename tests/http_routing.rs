// End-to-end HTTP routing through a TCP entry point.
mod common;

use std::time::Duration;

use common::{client, config, get, http_backend, start};
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn priority_then_specificity_then_name() {
    let a = http_backend("a").await;
    let b = http_backend("b").await;
    let c = http_backend("c").await;
    let running = start(
        config(json!({
            "entry_points": { "web": { "address": "127.0.0.1:0" } },
            "http": {
                "routers": {
                    "catch-all": { "rule": "PathPrefix(`/`)", "service": "a" },
                    "api": { "rule": "PathPrefix(`/api`)", "service": "b" },
                    "api-v2": { "rule": "Host(`x.test`) && PathPrefix(`/api`)", "service": "c" },
                    "forced": { "rule": "PathPrefix(`/`)", "service": "c", "priority": 100,
                                "entry_points": ["web"] },
                    "zz-tie": { "rule": "PathPrefix(`/tie`)", "service": "b" },
                    "aa-tie": { "rule": "PathPrefix(`/tie`)", "service": "a" }
                },
                "services": {
                    "a": { "servers": [{ "url": format!("http://{a}") }] },
                    "b": { "servers": [{ "url": format!("http://{b}") }] },
                    "c": { "servers": [{ "url": format!("http://{c}") }] }
                }
            }
        })),
        None,
    )
    .await;

    // Explicit priority beats any rule.
    let (status, body) = get(&running.url("web", "/api/users"), "y.test").await;
    assert_eq!(status, 200);
    assert_eq!(body, "c /api/users");

    // Without the forced router: specificity, then name.
    let reduced = config(json!({
        "entry_points": { "web": { "address": "127.0.0.1:0" } },
        "http": {
            "routers": {
                "catch-all": { "rule": "PathPrefix(`/`)", "service": "a" },
                "api": { "rule": "PathPrefix(`/api`)", "service": "b" },
                "api-v2": { "rule": "Host(`x.test`) && PathPrefix(`/api`)", "service": "c" },
                "zz-tie": { "rule": "PathPrefix(`/tie`)", "service": "b" },
                "aa-tie": { "rule": "PathPrefix(`/tie`)", "service": "a" }
            },
            "services": {
                "a": { "servers": [{ "url": format!("http://{a}") }] },
                "b": { "servers": [{ "url": format!("http://{b}") }] },
                "c": { "servers": [{ "url": format!("http://{c}") }] }
            }
        }
    }));
    running.reconciler.apply(&reduced.dynamic()).await.unwrap();

    assert_eq!(get(&running.url("web", "/api/x"), "x.test").await.1, "c /api/x");
    assert_eq!(get(&running.url("web", "/api/x"), "y.test").await.1, "b /api/x");
    assert_eq!(get(&running.url("web", "/other"), "y.test").await.1, "a /other");
    // Same rule, same specificity: lowest name wins, every time.
    for _ in 0..5 {
        assert_eq!(get(&running.url("web", "/tie"), "y.test").await.1, "a /tie");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn middlewares_wrap_in_declared_order() {
    let backend = http_backend("api").await;
    let running = start(
        config(json!({
            "entry_points": { "web": { "address": "127.0.0.1:0" } },
            "http": {
                "routers": {
                    "api": {
                        "rule": "PathPrefix(`/api`)",
                        "service": "api",
                        "middlewares": ["outer", "inner", "strip"]
                    }
                },
                "middlewares": {
                    "outer": {
                        "type": "headers",
                        "custom_request_headers": { "x-req": "outer" },
                        "custom_response_headers": { "x-order": "outer" }
                    },
                    "inner": {
                        "type": "headers",
                        "custom_request_headers": { "x-req": "inner" },
                        "custom_response_headers": { "x-order": "inner" }
                    },
                    "strip": { "type": "strip_prefix", "prefixes": ["/api"] }
                },
                "services": { "api": { "servers": [{ "url": format!("http://{backend}") }] } }
            }
        })),
        None,
    )
    .await;

    let response = client()
        .get(running.url("web", "/api/users"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    // The innermost request mutation reaches the service; the outermost
    // response mutation reaches the client.
    assert_eq!(response.headers()["x-seen"], "inner");
    assert_eq!(response.headers()["x-order"], "outer");
    assert_eq!(response.text().await.unwrap(), "api /users");
}

#[tokio::test(flavor = "multi_thread")]
async fn a_broken_router_does_not_take_down_its_neighbours() {
    let backend = http_backend("ok").await;
    let running = start(
        config(json!({
            "entry_points": { "web": { "address": "127.0.0.1:0" } },
            "http": {
                "routers": {
                    "healthy": { "rule": "Host(`ok.test`)", "service": "ok" },
                    "bad-rule": { "rule": "Host(`broken.test`", "service": "ok" },
                    "bad-service": { "rule": "Host(`nosvc.test`)", "service": "missing" },
                    "bad-middleware": {
                        "rule": "Host(`nomw.test`)", "service": "ok", "middlewares": ["nope"]
                    }
                },
                "services": { "ok": { "servers": [{ "url": format!("http://{backend}") }] } }
            }
        })),
        None,
    )
    .await;

    assert_eq!(get(&running.url("web", "/"), "ok.test").await, (200, "ok /".to_string()));
    for host in ["broken.test", "nosvc.test", "nomw.test"] {
        assert_eq!(get(&running.url("web", "/"), host).await.0, 404, "{host}");
    }

    let errors = running.reconciler.status().errors();
    for router in ["bad-rule", "bad-service", "bad-middleware"] {
        assert!(errors.contains_key(&format!("http.routers.{router}")), "{router}: {errors:?}");
    }
    assert!(!errors.contains_key("http.routers.healthy"));
    assert_eq!(
        running.reconciler.status().http.services["ok"].used_by,
        ["bad-middleware", "bad-rule", "healthy"]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unhealthy_targets_stop_receiving_traffic() {
    let up = http_backend("up").await;
    let down = common::closed_port().await;
    let running = start(
        config(json!({
            "entry_points": { "web": { "address": "127.0.0.1:0" } },
            "http": {
                "routers": { "api": { "rule": "PathPrefix(`/`)", "service": "api" } },
                "services": {
                    "api": {
                        "servers": [
                            { "url": format!("http://{up}") },
                            { "url": format!("http://{down}") }
                        ],
                        "health_check": {
                            "interval_secs": 1,
                            "timeout_secs": 1,
                            "unhealthy_threshold": 1,
                            "healthy_threshold": 1
                        }
                    },
                    "dead": {
                        "servers": [{ "url": format!("http://{down}") }],
                        "health_check": {
                            "interval_secs": 1,
                            "timeout_secs": 1,
                            "unhealthy_threshold": 1
                        }
                    }
                }
            }
        })),
        None,
    )
    .await;

    // Give the first probe round time to run.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    for _ in 0..6 {
        assert_eq!(get(&running.url("web", "/"), "a.test").await, (200, "up /".to_string()));
    }

    let only_dead = config(json!({
        "http": {
            "routers": { "api": { "rule": "PathPrefix(`/`)", "service": "dead" } },
            "services": {
                "dead": {
                    "servers": [{ "url": format!("http://{down}") }],
                    "health_check": { "interval_secs": 1, "timeout_secs": 1, "unhealthy_threshold": 1 }
                }
            }
        }
    }));
    running.reconciler.apply(&only_dead.dynamic()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(get(&running.url("web", "/"), "a.test").await.0, 503);
}

#[tokio::test(flavor = "multi_thread")]
async fn unmatched_requests_get_404() {
    let running = start(
        config(json!({ "entry_points": { "web": { "address": "127.0.0.1:0" } } })),
        None,
    )
    .await;
    let (status, body) = get(&running.url("web", "/anything"), "a.test").await;
    assert_eq!(status, 404);
    assert_eq!(body, "404 page not found");
}
