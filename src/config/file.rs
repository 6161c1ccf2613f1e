//! Configuration file loading

use super::Config;
use anyhow::{Context, Result};
use std::path::Path;

/// Load and validate config from a TOML file
pub fn load_from_path(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    load_str(&contents).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse and validate config from TOML text
pub fn load_str(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    super::validate(&config)?;
    Ok(config)
}
