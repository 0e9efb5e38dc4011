pub mod model;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub use model::{
    ClientConfig, RateLimitConfig, ReconnectPolicy, SaslConfig, TimeoutConfig, TlsConfig,
};

/// `<config dir>/crabirc/config.toml`.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("crabirc")
        .join("config.toml")
}

pub fn load_config() -> Result<ClientConfig> {
    load_config_from(&config_path())
}

/// Read and validate a TOML config file.
pub fn load_config_from(path: &Path) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: ClientConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config file")?;
    let config = config
        .prepare()
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}

pub fn save_config(config: &ClientConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(config).with_context(|| "Failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}
