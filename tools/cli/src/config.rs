//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use storekeep_storage::gdrive::AuthConfig;
use storekeep_storage::MetadataConfig;
use storekeep_sync::SyncConfig;

/// Everything the binary needs to wire up the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where local state lives. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub sync: SyncConfig,
    pub auth: AuthConfig,
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Load from a JSON file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(&self.sync.app_name)
        })
    }
}
