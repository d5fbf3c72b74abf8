use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    config::{loader::load_config, models::GatewayConfig},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that loads from a local file and watches for changes.
///
/// Editors often write a file in several steps, so change notifications are
/// debounced: a reload is signalled once the file has been quiet for the
/// debounce period.
pub struct FileConfigProvider {
    path: PathBuf,
    // Dropping the watcher stops notifications.
    _watcher: notify::RecommendedWatcher,
    update_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self> {
        let path = path.into();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::channel(1);

        let config_filename = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("Invalid config path: {}", path.display()))?
            .to_owned();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if (event.kind.is_modify()
                            || event.kind.is_create()
                            || event.kind.is_remove())
                            && event
                                .paths
                                .iter()
                                .any(|p| p.file_name() == Some(&config_filename))
                        {
                            tracing::trace!(kind = ?event.kind, "config file event");
                            let _ = raw_tx.send(());
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "file watch error"),
                }
            })?;

        let watch_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .wrap_err("Failed to watch config directory")?;

        tokio::spawn(debounce_events(raw_rx, update_tx, debounce));

        Ok(Self {
            path,
            _watcher: watcher,
            update_rx: std::sync::Mutex::new(Some(update_rx)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Forwards one signal per burst of raw events, `quiet` after the last one.
async fn debounce_events(
    mut raw: mpsc::UnboundedReceiver<()>,
    updates: mpsc::Sender<()>,
    quiet: Duration,
) {
    while raw.recv().await.is_some() {
        loop {
            match tokio::time::timeout(quiet, raw.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }
        tracing::debug!("config file changed");
        // A pending signal already covers this change.
        let _ = updates.try_send(());
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        load_config(&self.path).await
    }

    fn watch(&self) -> mpsc::Receiver<()> {
        let taken = match self.update_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // A second watcher gets a receiver that never fires.
        taken.unwrap_or_else(|| mpsc::channel(1).1)
    }
}
