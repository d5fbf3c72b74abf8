//! Switchyard - a dynamic edge router.
//!
//! Switchyard accepts HTTP, TCP and UDP traffic on statically configured
//! entry points and routes it according to a routing configuration that can
//! be replaced at runtime. The crate follows a **hexagonal architecture**:
//! routing logic lives in `core`, its seams are traits in `ports`, and the
//! concrete I/O (listeners, health probes, certificate files, config
//! sources) lives in `adapters`.
//!
//! # Features
//! - Rule engine: `Host`, `Path`, `PathPrefix`, `PathRegexp`, `Header`,
//!   `Method`, `ClientIP` and `HostSNI` matchers combined with `&&`, `||`,
//!   `!` and parentheses
//! - Deterministic route order: priority, then rule specificity, then name
//! - Ordered middleware chains (`headers`, `strip_prefix`, `replace_path`,
//!   `basic_auth`, `rate_limit`, `ip_allow_list`, `in_flight_limit`)
//! - Weighted round-robin and random load balancing with sticky cookies
//! - Active health checks with thresholds and passive demotion on errors
//! - TCP routing by TLS SNI with passthrough or local termination, and
//!   HTTP and TLS multiplexed on one port
//! - UDP session affinity with idle expiry
//! - Hot reload from a watched file or a polled HTTP endpoint; every reload
//!   builds a fresh router graph and swaps it in atomically
//! - Per-entity runtime status (`enabled`, `warning`, `disabled`) with
//!   error lists and `used_by`
//!
//! # Quick Example
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use switchyard::{
//!     HttpClientAdapter, MetricsEventSink, Reconciler, RouterFactory, TcpEntryPoint,
//!     config::load_config,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("switchyard.yaml").await?;
//! let factory = RouterFactory::new(
//!     config.entry_points.clone(),
//!     Arc::new(HttpClientAdapter::new()?),
//!     Arc::new(MetricsEventSink::new()),
//! );
//! let shutdown = CancellationToken::new();
//! let reconciler = Reconciler::new(factory, shutdown.clone());
//! reconciler.apply(&config.dynamic()).await;
//!
//! if let Some(slot) = reconciler.tcp_slot("web") {
//!     let entry_point = TcpEntryPoint::bind("web", "0.0.0.0:8080", slot).await?;
//!     entry_point.run(shutdown, Duration::from_secs(30)).await;
//! }
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Configuration problems never abort a reload: they are attached to the
//! router, service or middleware they concern and surface in
//! [`RuntimeStatus`]. Startup and I/O paths return `eyre::Result<T>` with
//! context attached via `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Published routers sit behind `arc_swap::ArcSwap`, so the accept paths
//! read them without locks. Shared mutable maps use `scc::HashMap`.
//!
//! # License
//! Licensed under Apache-2.0.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{
        CertificateStore, FileConfigProvider, HealthChecker, HttpClientAdapter,
        HttpConfigProvider, MetricsEventSink, TcpEntryPoint, UdpEntryPoint,
    },
    core::{ConfigError, DispatchError, Reconciler, RouterFactory, RuntimeStatus},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
