use anyhow::{Context, Result};
use cadenza_core::MachineConfig;
use std::{fs, path::Path};

/// Load a machine configuration, auto-detecting TOML or JSON format.
pub fn load<P: AsRef<Path>>(path: P) -> Result<MachineConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let extension = path.extension().and_then(|s| s.to_str());
    match extension {
        Some("toml") => from_toml(&content),
        Some("json") => from_json(&content),
        _ => {
            // Try TOML first (preferred), fall back to JSON.
            from_toml(&content).or_else(|_| from_json(&content))
        }
    }
}

pub fn from_toml(content: &str) -> Result<MachineConfig> {
    toml::from_str(content).context("failed to parse config as TOML")
}

pub fn from_json(content: &str) -> Result<MachineConfig> {
    serde_json::from_str(content).context("failed to parse config as JSON")
}
