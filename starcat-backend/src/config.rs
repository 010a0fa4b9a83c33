use crate::module::catalog::{CacheConfig, IngestOptions};
use crate::logging::LogSettings;
use crate::module::edsm::EdsmConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StarcatConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Log files are named `<log_prefix>.<date>.log`
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,

    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,

    #[serde(default)]
    pub ingest: IngestOptions,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub edsm: EdsmConfig,
}

fn default_database_path() -> String {
    "data/starcat.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_log_prefix() -> String {
    "starcat".to_string()
}

fn default_log_retention_days() -> u64 {
    3
}

impl Default for StarcatConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
            log_retention_days: default_log_retention_days(),
            ingest: IngestOptions::default(),
            cache: CacheConfig::default(),
            edsm: EdsmConfig::default(),
        }
    }
}

impl StarcatConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: StarcatConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        Ok(config)
    }

    pub fn log_settings(&self) -> LogSettings {
        LogSettings {
            dir: self.log_dir.clone().into(),
            prefix: self.log_prefix.clone(),
            level: self.log_level.clone(),
            retention_days: self.log_retention_days,
        }
    }

    /// Load the config file, or defaults when it does not exist
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}
