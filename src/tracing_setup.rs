use eyre::{Result, WrapErr};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogConfig, LogFormat};

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Switchyard structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .wrap_err("Failed to install tracing subscriber")?;

    tracing::info!("Switchyard console logging initialized");
    Ok(())
}

/// Initialize tracing with custom configuration.
///
/// `RUST_LOG`, when set, takes precedence over `level`.
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?
        }
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::info!(level, json = json_format, "Switchyard logging initialized");
    Ok(())
}

/// Initialize tracing from the `log` section of the static configuration.
pub fn init_from_config(config: &LogConfig) -> Result<()> {
    init_tracing_with_config(&config.level, config.format == LogFormat::Json, true)
}

/// Create a request-scoped tracing span. `router` is filled in once a route
/// has matched.
pub fn create_request_span(entry_point: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "request",
        entry_point = entry_point,
        http.method = method,
        http.path = path,
        router = tracing::field::Empty,
        http.status_code = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a backend request span
pub fn create_backend_span(backend_url: &str, method: &str, path: &str) -> tracing::Span {
    tracing::info_span!(
        "backend_request",
        backend.url = backend_url,
        http.method = method,
        http.path = path,
    )
}

/// Span covering one routed TCP connection.
pub fn create_connection_span(entry_point: &str, peer: &str) -> tracing::Span {
    tracing::info_span!(
        "connection",
        entry_point = entry_point,
        peer = peer,
        server_name = tracing::field::Empty,
        router = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_span() {
        let span = create_request_span("web", "GET", "/api/test");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "request");
        }
    }

    #[test]
    fn test_create_backend_span() {
        let span = create_backend_span("http://backend", "POST", "/data");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "backend_request");
        }
    }

    #[test]
    fn test_create_connection_span() {
        let span = create_connection_span("websecure", "127.0.0.1:4000");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "connection");
        }
    }
}
