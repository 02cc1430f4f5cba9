//! Content history configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main content history configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Identifier of this replica. Generated when left empty.
    pub replica_id: String,

    /// Prefix for every key written to the shared storage medium
    pub key_prefix: String,

    /// Period of the sync compaction task in milliseconds
    pub sync_interval_ms: u64,

    /// Events older than this are pruned from the pending queue
    pub max_event_age_ms: u64,

    /// Minimum token-set similarity for two items to be grouped as duplicates
    pub duplicate_threshold: f64,

    /// Maximum number of derived keyword tags per item
    pub max_ai_tags: usize,

    /// Cap for the `recentExports` and `canvasItems` lists in the sync document
    pub recent_list_cap: usize,

    /// Storage configuration
    pub storage: StorageConfig,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            replica_id: String::new(),
            key_prefix: "content_history".to_string(),
            sync_interval_ms: 1_000,
            max_event_age_ms: 60 * 60 * 1_000,
            duplicate_threshold: 0.8,
            max_ai_tags: 8,
            recent_list_cap: 50,
            storage: StorageConfig::default(),
        }
    }
}

/// File-backed storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one JSON document per storage key
    pub dir: PathBuf,

    /// How often the file watcher polls for changes written by other processes
    pub watch_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = dirs_next::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("content-history")
            .join("shared");

        Self {
            dir,
            watch_interval_ms: 500,
        }
    }
}

impl HistoryConfig {
    /// Load a configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the sync and dedup machinery cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.trim().is_empty() {
            return Err(Error::Config("key_prefix must not be empty".to_string()));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::Config("sync_interval_ms must be positive".to_string()));
        }
        if self.max_event_age_ms == 0 {
            return Err(Error::Config("max_event_age_ms must be positive".to_string()));
        }
        if !(self.duplicate_threshold > 0.0 && self.duplicate_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "duplicate_threshold must be in (0, 1], got {}",
                self.duplicate_threshold
            )));
        }
        if self.storage.watch_interval_ms == 0 {
            return Err(Error::Config(
                "storage.watch_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Replica id, generating a fresh one when unset
    pub fn resolved_replica_id(&self) -> String {
        if self.replica_id.trim().is_empty() {
            format!("replica-{}", uuid::Uuid::new_v4())
        } else {
            self.replica_id.clone()
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn keys(&self) -> StorageKeys {
        StorageKeys::new(&self.key_prefix)
    }
}

/// Well-known keys in the shared storage medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub history: String,
    pub tombstones: String,
    pub smart_folders: String,
    pub collections: String,
    pub duplicate_groups: String,
    pub sync: String,
}

impl StorageKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            history: format!("{}.history", prefix),
            tombstones: format!("{}.history_tombstones", prefix),
            smart_folders: format!("{}.smart_folders", prefix),
            collections: format!("{}.collections", prefix),
            duplicate_groups: format!("{}.duplicate_groups", prefix),
            sync: format!("{}.sync", prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = HistoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync_interval_ms, 1_000);
        assert_eq!(config.max_event_age_ms, 3_600_000);
        assert_eq!(config.duplicate_threshold, 0.8);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let config = HistoryConfig {
            duplicate_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HistoryConfig {
            duplicate_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = HistoryConfig {
            sync_interval_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sync_interval_ms"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HistoryConfig = toml::from_str(
            r#"
            replica_id = "desk"
            sync_interval_ms = 250

            [storage]
            dir = "/tmp/history"
            "#,
        )
        .unwrap();

        assert_eq!(config.replica_id, "desk");
        assert_eq!(config.sync_interval_ms, 250);
        assert_eq!(config.max_event_age_ms, 3_600_000);
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/history"));
        assert_eq!(config.storage.watch_interval_ms, 500);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.toml");
        std::fs::write(&path, "key_prefix = \"app\"\n").unwrap();

        let config = HistoryConfig::from_file(&path).unwrap();
        assert_eq!(config.keys().history, "app.history");
        assert_eq!(config.keys().sync, "app.sync");
    }

    #[test]
    fn test_from_file_invalid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.toml");
        std::fs::write(&path, "key_prefix = \"\"\n").unwrap();
        assert!(HistoryConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_resolved_replica_id() {
        let config = HistoryConfig::default();
        assert!(config.resolved_replica_id().starts_with("replica-"));

        let config = HistoryConfig {
            replica_id: "tab-1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.resolved_replica_id(), "tab-1");
    }
}
