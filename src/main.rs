use std::{collections::BTreeMap, path::Path, pin::Pin, sync::Arc, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use switchyard::{
    CertificateStore, FileConfigProvider, HttpClientAdapter, HttpConfigProvider, MetricsEventSink,
    Reconciler, RouterFactory, TcpEntryPoint, UdpEntryPoint,
    config::{
        EntryPointConfig, GatewayConfig, ServerConfigValidator, Transport, loader::load_config,
    },
    ports::config_provider::ConfigProvider,
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};
use tokio::task::JoinSet;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    /// Configuration file, or an http(s) URL serving the configuration as JSON
    #[clap(short, long, default_value = "switchyard.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate a configuration and print the runtime status it would produce
    Validate {
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
    /// Start the router (default)
    Serve {
        #[clap(short, long, default_value = "switchyard.yaml")]
        config: String,
    },
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Loads the first document and creates the provider that watches for the
/// next ones. The provider settings come from the first document.
async fn open_source(source: &str) -> Result<(GatewayConfig, Arc<dyn ConfigProvider>)> {
    if is_remote(source) {
        let probe = HttpConfigProvider::new(source.to_string(), Duration::from_secs(3600));
        let config = probe
            .load_config()
            .await
            .with_context(|| format!("Failed to load initial config from {source}"))?;
        drop(probe);
        let provider = HttpConfigProvider::new(
            source.to_string(),
            Duration::from_secs(config.providers.poll_interval_secs),
        );
        Ok((config, Arc::new(provider)))
    } else {
        let config = load_config(source)
            .await
            .with_context(|| format!("Failed to load initial config from {source}"))?;
        let provider = FileConfigProvider::new(
            source,
            Duration::from_millis(config.providers.debounce_ms),
        )
        .context("Failed to watch config file")?;
        Ok((config, Arc::new(provider)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(source: &str) -> Result<()> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        eprintln!("aws-lc-rs crypto provider not installed ({e:?}); using the existing one");
    }

    let (config, provider) = open_source(source).await?;
    ServerConfigValidator::validate(&config).context("Invalid static configuration")?;
    tracing_setup::init_from_config(&config.log)?;
    tracing::info!(source, entry_points = config.entry_points.len(), "Starting switchyard");

    let certificates = Arc::new(
        CertificateStore::load(&config.tls.certificates).context("Failed to load certificates")?,
    );
    let http_client = Arc::new(
        HttpClientAdapter::from_config(&config.servers_transport)
            .context("Failed to create HTTP client adapter")?,
    );
    let shutdown = GracefulShutdown::new();

    let factory = RouterFactory::new(
        config.entry_points.clone(),
        http_client,
        Arc::new(MetricsEventSink::new()),
    )
    .with_certificates(certificates.clone())
    .with_shutdown(shutdown.token());
    let reconciler = Arc::new(Reconciler::new(factory, shutdown.token()));
    if let Some(status) = reconciler.apply(&config.dynamic()).await {
        log_status_errors(&status.errors());
    }

    let mut listeners = JoinSet::new();
    for (name, entry_point) in &config.entry_points {
        match bind(name, entry_point, &reconciler, &shutdown).await {
            Ok(listener) => {
                listeners.spawn(listener);
            }
            Err(e) => {
                shutdown.trigger(ShutdownReason::Internal);
                while listeners.join_next().await.is_some() {}
                return Err(e);
            }
        }
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run_signal_handler().await });
    }
    tokio::spawn(watch_config(
        provider,
        config.entry_points.clone(),
        certificates,
        reconciler.clone(),
        shutdown.clone(),
    ));

    let reason = shutdown.wait().await;
    tracing::info!(?reason, "Shutting down");
    while listeners.join_next().await.is_some() {}
    reconciler.shutdown().await;
    tracing::info!("Graceful shutdown completed");
    Ok(())
}

type Listener = Pin<Box<dyn Future<Output = ()> + Send>>;

async fn bind(
    name: &str,
    entry_point: &EntryPointConfig,
    reconciler: &Reconciler,
    shutdown: &GracefulShutdown,
) -> Result<Listener> {
    let token = shutdown.token();
    let drain = shutdown.drain_timeout();
    let run: Listener = match entry_point.transport {
        Transport::Tcp => {
            let slot = reconciler
                .tcp_slot(name)
                .ok_or_else(|| eyre!("No router slot for entry point '{name}'"))?;
            let listener = TcpEntryPoint::bind(name, &entry_point.address, slot).await?;
            Box::pin(listener.run(token, drain))
        }
        Transport::Udp => {
            let slot = reconciler
                .udp_slot(name)
                .ok_or_else(|| eyre!("No router slot for entry point '{name}'"))?;
            let timeout = Duration::from_secs(entry_point.udp_session_timeout_secs);
            let listener = UdpEntryPoint::bind(name, &entry_point.address, slot, timeout).await?;
            Box::pin(listener.run(token))
        }
    };
    Ok(run)
}

/// Applies every new snapshot the provider announces until shutdown.
async fn watch_config(
    provider: Arc<dyn ConfigProvider>,
    entry_points: BTreeMap<String, EntryPointConfig>,
    certificates: Arc<CertificateStore>,
    reconciler: Arc<Reconciler>,
    shutdown: GracefulShutdown,
) {
    let token = shutdown.token();
    let mut changes = provider.watch();
    tracing::info!("Config watcher task started");
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            change = changes.recv() => if change.is_none() { break },
        }

        let config = match provider.load_config().await {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Failed to reload configuration; keeping the current one");
                continue;
            }
        };
        if config.entry_points != entry_points {
            tracing::warn!("Entry point changes require a restart and are ignored");
        }
        if let Err(e) = certificates.reload(&config.tls.certificates) {
            tracing::error!(error = %e, "Failed to reload certificates; keeping the current set");
        }
        if let Some(status) = reconciler.apply(&config.dynamic()).await {
            log_status_errors(&status.errors());
        }
    }
    tracing::info!("Config watcher task is shutting down");
}

fn log_status_errors(errors: &BTreeMap<String, Vec<String>>) {
    for (entity, messages) in errors {
        for message in messages {
            tracing::error!(entity = %entity, error = %message, "configuration error");
        }
    }
}

/// Builds the routers a configuration would produce, without binding
/// anything, and prints the resulting status.
async fn validate_config_command(source: &str) -> Result<()> {
    let config = if is_remote(source) {
        HttpConfigProvider::new(source.to_string(), Duration::from_secs(3600))
            .load_config()
            .await?
    } else {
        if !Path::new(source).exists() {
            return Err(eyre!("Configuration file '{source}' not found"));
        }
        load_config(source).await?
    };

    let problems = ServerConfigValidator::collect(&config);
    for problem in &problems {
        eprintln!("error: {problem}");
    }

    let certificates = match CertificateStore::load(&config.tls.certificates) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            eprintln!("error: {e}");
            None
        }
    };
    let http_client = match HttpClientAdapter::from_config(&config.servers_transport) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e:#}");
            HttpClientAdapter::new()?
        }
    };
    let mut factory = RouterFactory::new(
        config.entry_points.clone(),
        Arc::new(http_client),
        Arc::new(MetricsEventSink::new()),
    );
    if let Some(certificates) = &certificates {
        factory = factory.with_certificates(certificates.clone());
    }
    let built = factory.build(&config.dynamic(), None, 1);
    println!("{}", serde_json::to_string_pretty(&built.status)?);

    let failed = built.status.errors().len();
    if problems.is_empty() && certificates.is_some() && failed == 0 {
        eprintln!("configuration is valid");
        Ok(())
    } else {
        Err(eyre!(
            "configuration is invalid: {} static problem(s), {failed} entity error(s)",
            problems.len() + usize::from(certificates.is_none())
        ))
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        return Err(eyre!("Configuration file '{config_path}' already exists"));
    }

    let default_config = r#"# Switchyard configuration

entry_points:
  web:
    address: "0.0.0.0:8080"
  dns:
    address: "0.0.0.0:5353"
    transport: udp

log:
  level: info
  format: json

http:
  routers:
    api:
      rule: "Host(`api.localhost`) && PathPrefix(`/v1`)"
      service: api
      middlewares: [strip-v1]
  middlewares:
    strip-v1:
      type: strip_prefix
      prefixes: ["/v1"]
  services:
    api:
      servers:
        - url: "http://127.0.0.1:3000"
      health_check:
        path: /health
        interval_secs: 10

# tcp:
#   routers:
#     db:
#       rule: "HostSNI(`*`)"
#       service: db
#   services:
#     db:
#       servers:
#         - address: "127.0.0.1:5432"

udp:
  routers:
    dns:
      service: dns
  services:
    dns:
      servers:
        - address: "127.0.0.1:53"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("Run 'switchyard serve --config {config_path}' to start the router");
    Ok(())
}
