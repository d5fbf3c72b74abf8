use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate.
/// Supports YAML, JSON and TOML; the format follows the file extension.
pub async fn load_config(config_path: impl AsRef<Path>) -> Result<GatewayConfig> {
    load_config_sync(config_path.as_ref())
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &Path) -> Result<GatewayConfig> {
    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            file_format(config_path),
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}

/// Parse a configuration document held in memory.
pub fn parse_config(content: &str, format: FileFormat) -> Result<GatewayConfig> {
    Config::builder()
        .add_source(config::File::from_str(content, format))
        .build()
        .wrap_err("Failed to parse configuration")?
        .try_deserialize()
        .wrap_err("Failed to deserialize configuration")
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}
