use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{config::models::GatewayConfig, ports::config_provider::ConfigProvider};

/// Configuration provider that fetches a JSON document from an HTTP URL and
/// polls it for changes.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    stop: CancellationToken,
}

impl HttpConfigProvider {
    pub fn new(url: String, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let stop = CancellationToken::new();

        tokio::spawn(Self::poll(
            client.clone(),
            url.clone(),
            poll_interval,
            tx,
            stop.clone(),
        ));

        Self {
            url,
            client,
            update_rx: std::sync::Mutex::new(Some(rx)),
            stop,
        }
    }

    async fn poll(
        client: Client,
        url: String,
        poll_interval: Duration,
        tx: mpsc::Sender<()>,
        stop: CancellationToken,
    ) {
        let mut last_hash: Option<u64> = None;
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                _ = interval.tick() => {}
            }
            let config = match Self::fetch_config(&client, &url).await {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "failed to poll remote config");
                    continue;
                }
            };
            // Compare canonical JSON; the document has no Hash of its own.
            let Ok(json) = serde_json::to_string(&config) else {
                continue;
            };
            let mut hasher = DefaultHasher::new();
            json.hash(&mut hasher);
            let hash = hasher.finish();
            if last_hash.is_some_and(|last| last != hash) {
                tracing::info!(url = %url, "remote configuration changed");
                let _ = tx.try_send(());
            }
            last_hash = Some(hash);
        }
    }

    async fn fetch_config(client: &Client, url: &str) -> Result<GatewayConfig> {
        let resp = client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Configuration endpoint returned an error")?;
        resp.json::<GatewayConfig>()
            .await
            .context("Failed to parse JSON config")
    }
}

impl Drop for HttpConfigProvider {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        Self::fetch_config(&self.client, &self.url).await
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let taken = match self.update_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        taken.unwrap_or_else(|| mpsc::channel(1).1)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, routing::get};
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::EntryPointConfig;

    #[tokio::test]
    async fn test_http_config_provider() -> Result<()> {
        let mut initial = GatewayConfig::default();
        initial
            .entry_points
            .insert("web".to_string(), EntryPointConfig::tcp("127.0.0.1:8080"));
        let config_state = Arc::new(Mutex::new(initial));

        let state = config_state.clone();
        let app = Router::new().route(
            "/config",
            get(move || async move {
                let config = state.lock().unwrap().clone();
                Json(config)
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{addr}/config");
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpConfigProvider::new(url, Duration::from_millis(100));
        let config = provider.load_config().await?;
        assert_eq!(config.entry_points["web"].address, "127.0.0.1:8080");

        let mut rx = provider.watch();
        // Let the poller record the initial document.
        tokio::time::sleep(Duration::from_millis(250)).await;
        config_state
            .lock()
            .unwrap()
            .entry_points
            .insert("api".to_string(), EntryPointConfig::tcp("127.0.0.1:9090"));

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(notification.is_ok(), "Timed out waiting for config update");
        assert!(notification.unwrap().is_some(), "Channel closed unexpectedly");

        let config = provider.load_config().await?;
        assert_eq!(config.entry_points.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_status_is_an_error() -> Result<()> {
        let app = Router::new();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpConfigProvider::new(
            format!("http://{addr}/missing"),
            Duration::from_secs(60),
        );
        assert!(provider.load_config().await.is_err());
        Ok(())
    }
}
