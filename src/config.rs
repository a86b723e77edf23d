use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{ConversionOptions, DEFAULT_MAX_ATTACHMENT_BYTES};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversionConfig {
    /// Directory relative image and file paths resolve against.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
        }
    }
}

fn default_max_attachment_bytes() -> u64 {
    DEFAULT_MAX_ATTACHMENT_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Defaults for every section, used when no config file exists.
    pub fn minimal() -> Self {
        Self {
            conversion: ConversionConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            base_dir: self.conversion.base_dir.clone(),
            max_attachment_bytes: self.conversion.max_attachment_bytes,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.conversion.max_attachment_bytes == 0 {
        anyhow::bail!("conversion.max_attachment_bytes must be > 0");
    }

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    // A relative base_dir is relative to the config file, not the caller's cwd.
    if let Some(base) = config.conversion.base_dir.take() {
        let expanded = PathBuf::from(shellexpand::tilde(&base.to_string_lossy()).as_ref());
        let resolved = if expanded.is_relative() {
            path.parent().unwrap_or(Path::new(".")).join(expanded)
        } else {
            expanded
        };
        config.conversion.base_dir = Some(resolved);
    }

    Ok(config)
}
