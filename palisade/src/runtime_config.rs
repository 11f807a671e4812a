use anyhow::{Context, Result};
use palisade_core::FirewallSettings;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub firewall: FirewallSettings,
    pub log: LogConfig,
}

pub fn load_runtime_config(path: &Path) -> Result<RuntimeConfig> {
    if !path.exists() {
        return Ok(RuntimeConfig::default());
    }
    let body = fs::read_to_string(path)
        .with_context(|| format!("read runtime config {}", path.display()))?;
    parse_runtime_config(&body).with_context(|| format!("parse runtime config {}", path.display()))
}

fn parse_runtime_config(body: &str) -> Result<RuntimeConfig, serde_yaml::Error> {
    if body.trim().is_empty() {
        return Ok(RuntimeConfig::default());
    }
    serde_yaml::from_str(body)
}
