//! Vivian configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VivianError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VivianConfig {
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl VivianConfig {
    /// Load config from the default path (~/.vivian/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VivianError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VivianError::Config(format!("Failed to parse config: {e}")))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| VivianError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Vivian home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vivian")
    }
}

/// Expand a leading `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Append-only JSONL log of every recorded event.
    #[serde(default)]
    pub persistent_log: Option<String>,
    /// Number of events kept in the in-memory log.
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default)]
    pub enable_async_loop: bool,
}

fn default_log_capacity() -> usize { 1000 }

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            persistent_log: None,
            log_capacity: default_log_capacity(),
            enable_async_loop: false,
        }
    }
}

impl EventBusConfig {
    pub fn persistent_log_path(&self) -> Option<PathBuf> {
        self.persistent_log.as_deref().map(expand_path)
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Global run history length.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Per-job run history length.
    #[serde(default = "default_job_history_limit")]
    pub job_history_limit: usize,
    /// Publish `scheduler_job_*` events when a bus is attached.
    #[serde(default = "bool_true")]
    pub publish_events: bool,
    /// JSON file the job table is persisted to.
    #[serde(default)]
    pub store_path: Option<String>,
}

fn bool_true() -> bool { true }
fn default_tick_ms() -> u64 { 500 }
fn default_history_limit() -> usize { 200 }
fn default_job_history_limit() -> usize { 10 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            history_limit: default_history_limit(),
            job_history_limit: default_job_history_limit(),
            publish_events: true,
            store_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn store_path(&self) -> Option<PathBuf> {
        self.store_path.as_deref().map(expand_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VivianConfig::default();
        assert_eq!(config.scheduler.tick_ms, 500);
        assert_eq!(config.scheduler.history_limit, 200);
        assert_eq!(config.scheduler.job_history_limit, 10);
        assert!(config.scheduler.publish_events);
        assert_eq!(config.event_bus.log_capacity, 1000);
        assert!(config.event_bus.persistent_log.is_none());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [event_bus]
            persistent_log = "/tmp/vivian/events.jsonl"
            enable_async_loop = true

            [scheduler]
            tick_ms = 250
            publish_events = false
        "#;

        let config: VivianConfig = toml::from_str(toml_str).unwrap();
        assert!(config.event_bus.enable_async_loop);
        assert_eq!(
            config.event_bus.persistent_log_path(),
            Some(PathBuf::from("/tmp/vivian/events.jsonl"))
        );
        assert_eq!(config.event_bus.log_capacity, 1000);
        assert_eq!(config.scheduler.tick(), std::time::Duration::from_millis(250));
        assert!(!config.scheduler.publish_events);
        assert_eq!(config.scheduler.history_limit, 200);
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: VivianConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.tick_ms, 500);
        assert!(!config.event_bus.enable_async_loop);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("vivian-test-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = VivianConfig::default();
        config.scheduler.tick_ms = 100;
        config.event_bus.log_capacity = 7;
        config.save_to(&path).unwrap();

        let loaded = VivianConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.tick_ms, 100);
        assert_eq!(loaded.event_bus.log_capacity, 7);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_from_invalid_toml() {
        let dir = std::env::temp_dir().join(format!("vivian-test-badcfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[scheduler\ntick_ms = ").unwrap();
        let err = VivianConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, VivianError::Config(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_home_dir() {
        let home = VivianConfig::home_dir();
        assert!(home.to_string_lossy().contains("vivian"));
    }
}
