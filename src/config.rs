use anyhow::{Context, Result};
use serde::Deserialize;

use crate::plugin;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    pub fstype: String,
    pub path: String,
    #[serde(default)]
    pub config: toml::Table,
}

/// Parse the config file into a Config struct.
pub fn parse_config(filepath: &str) -> Result<Config> {
    let content = std::fs::read_to_string(filepath).context("failed to read config file")?;
    let c: Config = toml::from_str(&content).context("failed to parse toml config data")?;

    if c.host.is_empty() {
        bail!("host must not be empty");
    }

    Ok(c)
}

/// Converts a TOML mount config table into the opaque mapping handed to the
/// plugin.
pub fn plugin_config(table: &toml::Table) -> Result<plugin::Config> {
    let value = serde_json::to_value(table).context("failed to convert mount config")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("mount config must be a table"),
    }
}
