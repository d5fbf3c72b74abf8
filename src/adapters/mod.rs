pub mod certificate_store;
pub mod config_providers;
pub mod event_sink;
pub mod health_checker;
pub mod http_client;
pub mod tcp_entry_point;
pub mod udp_entry_point;

/// Re-export commonly used types from adapters
pub use certificate_store::CertificateStore;
pub use config_providers::{FileConfigProvider, HttpConfigProvider};
pub use event_sink::MetricsEventSink;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use tcp_entry_point::TcpEntryPoint;
pub use udp_entry_point::UdpEntryPoint;
