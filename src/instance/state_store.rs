//! Durable instance table
//!
//! The whole table is rewritten on every save: serialize to `<path>.tmp`,
//! fsync, then rename over the real file so readers never see a torn write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use super::types::Instance;
use crate::error::{PloyError, Result};

/// On-disk document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub instances: Vec<Instance>,
    pub last_saved: DateTime<Utc>,
}

/// File-backed persistence for the instance table
pub struct StateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted table; a missing file is an empty table
    pub async fn load(&self) -> Result<Vec<Instance>> {
        let _guard = self.lock.lock().await;

        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.persistence_error(e)),
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        let state: PersistedState = serde_json::from_slice(&bytes)?;
        debug!(
            path = %self.path.display(),
            instances = state.instances.len(),
            last_saved = %state.last_saved,
            "Loaded instance state"
        );
        Ok(state.instances)
    }

    /// Atomically replace the persisted table
    pub async fn save(&self, instances: &[Instance]) -> Result<()> {
        let _guard = self.lock.lock().await;

        let state = PersistedState {
            instances: instances.to_vec(),
            last_saved: Utc::now(),
        };
        let payload = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.persistence_error(e))?;
            }
        }

        let tmp_path = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| self.persistence_error(e))?;
        file.write_all(&payload)
            .await
            .map_err(|e| self.persistence_error(e))?;
        file.sync_all().await.map_err(|e| self.persistence_error(e))?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(self.persistence_error(e));
        }

        debug!(path = %self.path.display(), instances = instances.len(), "Saved instance state");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "instances.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn persistence_error(&self, e: std::io::Error) -> PloyError {
        PloyError::Persistence {
            path: self.path.clone(),
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::types::{InstanceStatus, StrategyRef};

    fn sample(id: &str, name: &str) -> Instance {
        let mut instance = Instance::new(
            id.to_string(),
            StrategyRef::new(name, format!("/srv/strategies/{name}")),
            PathBuf::from("/srv"),
        );
        instance.pid = 1234;
        instance
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("instances.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("instances.json"));

        let mut crashed = sample("b", "split_arb");
        crashed.mark_crashed("process 1234 exited unexpectedly");
        store.save(&[sample("a", "momentum"), crashed.clone()]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].strategy.name, "momentum");
        assert_eq!(loaded[1], crashed);
        assert_eq!(loaded[1].status, InstanceStatus::Crashed);

        // No temp file left behind
        assert!(!dir.path().join("nested").join("instances.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("instances.json"));
        store.save(&[sample("a", "momentum")]).await.unwrap();

        let raw = std::fs::read_to_string(store.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(doc["instances"].is_array());
        assert!(doc["last_saved"].is_string());
        assert_eq!(doc["instances"][0]["status"], "running");
        assert_eq!(doc["instances"][0]["pid"], 1234);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instances.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = StateStore::new(path);
        assert!(matches!(store.load().await, Err(PloyError::Json(_))));
    }
}
