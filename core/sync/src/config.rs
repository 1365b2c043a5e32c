//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Prefix of per-user snapshot namespaces (`<app_name>-<userId>`).
    pub app_name: String,
    /// Seconds between periodic passes.
    pub sync_interval_secs: u64,
    /// Deadline for a single remote call.
    pub request_timeout_secs: u64,
    /// Snapshot files fetched at once during restore.
    pub fetch_concurrency: usize,
    /// Tables included in backup and restore.
    pub tables: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            app_name: "storekeep".to_string(),
            sync_interval_secs: 60,
            request_timeout_secs: 10,
            fetch_concurrency: 5,
            tables: vec![
                "products".to_string(),
                "customers".to_string(),
                "invoices".to_string(),
            ],
        }
    }
}

impl SyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.fetch_concurrency, 5);
        assert_eq!(config.tables.len(), 3);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"sync_interval_secs": 5}"#).unwrap();
        assert_eq!(config.sync_interval_secs, 5);
        assert_eq!(config.app_name, "storekeep");
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let config = SyncConfig {
            sync_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
    }
}
