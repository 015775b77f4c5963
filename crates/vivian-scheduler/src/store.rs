//! File-based job store: lightweight persistence.
//! Jobs are saved as one pretty-printed JSON object keyed by job name.
//! Only written when the job table changes, never on a tick.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vivian_core::{Result, VivianConfig, VivianError};

use crate::engine::{PersistenceHook, Scheduler};
use crate::job::SerializedJob;

/// File-based job store.
#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    /// Store jobs in the JSON file at `path`, creating its directory.
    pub fn new(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Default store path (~/.vivian/scheduler/jobs.json).
    pub fn default_path() -> PathBuf {
        VivianConfig::home_dir().join("scheduler").join("jobs.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, jobs: &BTreeMap<String, SerializedJob>) -> Result<()> {
        let json = serde_json::to_string_pretty(jobs)?;
        std::fs::write(&self.path, json)
            .map_err(|e| VivianError::Store(format!("write {}: {e}", self.path.display())))?;
        tracing::debug!("💾 Saved {} jobs to {}", jobs.len(), self.path.display());
        Ok(())
    }

    /// Load saved jobs. A missing or unreadable file yields no jobs.
    pub fn load(&self) -> BTreeMap<String, SerializedJob> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        match std::fs::read_to_string(&self.path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("⚠️ Failed to parse {}: {e}", self.path.display());
                BTreeMap::new()
            }),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read {}: {e}", self.path.display());
                BTreeMap::new()
            }
        }
    }

    /// This store as a scheduler persistence hook.
    pub fn hook(self) -> PersistenceHook {
        let store = Arc::new(self);
        Arc::new(move |jobs: &BTreeMap<String, SerializedJob>| -> anyhow::Result<()> {
            store.save(jobs)?;
            Ok(())
        })
    }

    /// Save the scheduler's job table on every add and remove.
    pub fn attach(self, scheduler: &Scheduler) {
        let hook = self.hook();
        scheduler.set_persistence_hook(move |jobs| hook(jobs));
    }
}
