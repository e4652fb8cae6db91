use std::path::Path;

use config::{Config as Settings, Environment, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::Config;

/// Load configuration from a file using the config crate.
/// YAML is the primary format; JSON and TOML are accepted by extension.
/// `SYNAPSE_`-prefixed environment variables override file values
/// (nested keys separated by `__`, e.g. `SYNAPSE_SERVER__PORT`).
pub fn load_config(config_path: &str) -> Result<Config> {
    let path = Path::new(config_path);

    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    };

    let settings = Settings::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .add_source(Environment::with_prefix("SYNAPSE").separator("__"))
        .build()
        .with_context(|| format!("Failed to read config from {}", path.display()))?;

    let cfg: Config = settings.try_deserialize().with_context(|| {
        format!("Failed to deserialize config from {}", path.display())
    })?;

    Ok(cfg)
}
